/// Review service
///
/// The entry points callers drive workflows through: create and start an
/// instance, submit reviewer decisions, and read back step configuration and
/// history. Each mutating call runs in one SQLite transaction that covers the
/// task write, the hooks and the transition; it is committed only when all of
/// them succeed.

use crate::error::{FlowError, FlowResult};
use crate::runtime::{
    attachments::{AttachmentStore, StoredAttachment},
    audit::{AuditRecord, AuditSink, TracingAuditSink},
    engine::{TransitionEngine, TransitionOutcome},
    hooks::HookContext,
};
use crate::workflow::{
    lifecycle::{BaseContext, Flow},
    registry::{WorkflowType, WorkflowTypeRegistry},
    step::TaskKind,
    storage::{WorkflowStorage, MAX_PAGE_SIZE},
    tasks::ReviewTaskStore,
    types::{
        FlowStatus, NewWorkflowInstance, ReviewTask, Submission, TaskId, WorkflowId,
        WorkflowInstance,
    },
};
use chrono::Utc;
use serde_json::Value;
use sqlx::SqliteConnection;
use std::sync::Arc;

/// Result of a reviewer submission
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    /// The decided (or transferred) task as stored
    pub task: ReviewTask,
    /// `None` for a transfer, which never evaluates the step
    pub transition: Option<TransitionOutcome>,
    /// Instance after the submission
    pub instance: WorkflowInstance,
    /// Remark handed to the audit sink
    pub remark: String,
    /// Files stored for this submission
    pub attachments: Vec<StoredAttachment>,
}

/// Which task a submission decides
struct SubmissionRequest<'a> {
    workflow_id: WorkflowId,
    /// `None` selects the actor's open task at the current step
    task_id: Option<TaskId>,
    actor: &'a str,
    submission: &'a Submission,
    context: &'a BaseContext,
}

/// Drives workflow instances through their steps
#[derive(Clone)]
pub struct ReviewService {
    storage: WorkflowStorage,
    registry: Arc<WorkflowTypeRegistry>,
    engine: TransitionEngine,
    /// Receives one record per successful operation
    audit: Arc<dyn AuditSink>,
    /// Submissions carrying files are refused when unset
    attachments: Option<Arc<dyn AttachmentStore>>,
    /// Enforce the assignee check on non-public steps
    require_login: bool,
}

impl ReviewService {
    /// Service auditing to tracing only, without an attachment store
    pub fn new(storage: WorkflowStorage, registry: Arc<WorkflowTypeRegistry>) -> Self {
        Self {
            engine: TransitionEngine::new(storage.clone()),
            storage,
            registry,
            audit: Arc::new(TracingAuditSink),
            attachments: None,
            require_login: true,
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_attachments(mut self, store: Arc<dyn AttachmentStore>) -> Self {
        self.attachments = Some(store);
        self
    }

    /// With `false`, any user may decide any task
    pub fn require_login(mut self, required: bool) -> Self {
        self.require_login = required;
        self
    }

    pub fn registry(&self) -> &WorkflowTypeRegistry {
        &self.registry
    }

    pub fn storage(&self) -> &WorkflowStorage {
        &self.storage
    }

    /// Create an instance positioned before its first step
    pub async fn create_instance(
        &self,
        workflow_type: &str,
        creator: &str,
        data: Value,
    ) -> FlowResult<WorkflowInstance> {
        let wt = self.registry.get(workflow_type)?;
        if creator.trim().is_empty() {
            return Err(FlowError::Validation(
                "a workflow instance needs a creator".to_string(),
            ));
        }

        let mut tx = self.storage.pool().begin().await?;
        let instance = self
            .storage
            .insert(
                &mut *tx,
                &NewWorkflowInstance {
                    workflow_type: wt.name().to_string(),
                    creator: creator.to_string(),
                    status: wt.initial_status(),
                    data,
                },
            )
            .await?;
        tx.commit().await?;

        tracing::info!(
            "🆕 Created workflow {} ({}) for '{}'",
            instance.id,
            instance.workflow_type,
            creator
        );
        self.record_audit(creator, &instance, "create", "created").await;
        Ok(instance)
    }

    /// Enter the first step, or re-enter it after the instance was returned to draft
    ///
    /// Only the creator may start an instance.
    pub async fn start(
        &self,
        workflow_type: &str,
        id: WorkflowId,
        actor: &str,
        context: &BaseContext,
    ) -> FlowResult<TransitionOutcome> {
        let wt = self.registry.get(workflow_type)?;
        let mut tx = self.storage.pool().begin().await?;
        let mut flow = self.bind(&mut *tx, &wt, id, actor, context).await?;

        if flow.instance().creator != actor {
            return Err(FlowError::NotCreator {
                user: actor.to_string(),
                workflow_id: id,
            });
        }
        if flow.instance().status.is_terminal() {
            return Err(FlowError::Validation(format!(
                "workflow {} is already closed ({:?})",
                id,
                flow.instance().status
            )));
        }

        let outcome = self.engine.enter_first_step(&mut *tx, &mut flow).await?;
        tx.commit().await?;

        self.record_audit(actor, flow.instance(), "start", "started").await;
        Ok(outcome)
    }

    /// Decide one reviewer task and re-evaluate its step
    pub async fn submit(
        &self,
        workflow_type: &str,
        workflow_id: WorkflowId,
        task_id: TaskId,
        actor: &str,
        submission: Submission,
        context: &BaseContext,
    ) -> FlowResult<SubmitOutcome> {
        self.run_submission(
            workflow_type,
            SubmissionRequest {
                workflow_id,
                task_id: Some(task_id),
                actor,
                submission: &submission,
                context,
            },
        )
        .await
    }

    /// Decide the actor's open task at the instance's current step
    pub async fn submit_current(
        &self,
        workflow_type: &str,
        workflow_id: WorkflowId,
        actor: &str,
        submission: Submission,
        context: &BaseContext,
    ) -> FlowResult<SubmitOutcome> {
        self.run_submission(
            workflow_type,
            SubmissionRequest {
                workflow_id,
                task_id: None,
                actor,
                submission: &submission,
                context,
            },
        )
        .await
    }

    async fn run_submission(
        &self,
        workflow_type: &str,
        request: SubmissionRequest<'_>,
    ) -> FlowResult<SubmitOutcome> {
        request.submission.validate()?;
        let wt = self.registry.get(workflow_type)?;
        let actor = request.actor;
        let workflow_id = request.workflow_id;

        let mut tx = self.storage.pool().begin().await?;
        let mut uploaded = Vec::new();

        let outcome = match self
            .apply_submission(&mut *tx, &wt, request, &mut uploaded)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(
                    "Submission by '{}' on workflow {} ({}) rolled back: {}",
                    actor,
                    workflow_id,
                    workflow_type,
                    e
                );
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::error!("Failed to roll back submission transaction: {}", rollback_err);
                }
                self.discard_attachments(&uploaded).await;
                return Err(e);
            }
        };

        if let Err(e) = tx.commit().await {
            self.discard_attachments(&uploaded).await;
            return Err(e.into());
        }

        self.record_audit(actor, &outcome.instance, &outcome.task.step_key, &outcome.remark)
            .await;
        Ok(outcome)
    }

    async fn apply_submission(
        &self,
        conn: &mut SqliteConnection,
        wt: &Arc<WorkflowType>,
        request: SubmissionRequest<'_>,
        uploaded: &mut Vec<StoredAttachment>,
    ) -> FlowResult<SubmitOutcome> {
        let SubmissionRequest {
            workflow_id,
            task_id,
            actor,
            submission,
            context,
        } = request;

        let mut flow = self.bind(conn, wt, workflow_id, actor, context).await?;
        if flow.instance().status != FlowStatus::Running {
            return Err(FlowError::Validation(format!(
                "workflow {} is {:?}, not awaiting review",
                workflow_id,
                flow.instance().status
            )));
        }
        let current = flow.current_step()?.clone();
        let store = ReviewTaskStore::new(current.task_kind().clone());

        let mut task = match task_id {
            Some(id) => store.get(conn, id).await?,
            None => store
                .find_open(conn, flow.type_name(), flow.id(), current.key(), actor)
                .await?
                .ok_or_else(|| {
                    FlowError::not_found(
                        "open review task",
                        format!("{} at step '{}' of workflow {}", actor, current.key(), workflow_id),
                    )
                })?,
        };

        if task.workflow_id != flow.id() || task.workflow_type != flow.type_name() {
            return Err(FlowError::not_found(
                "review task",
                format!("{} of workflow {}", task.id, workflow_id),
            ));
        }
        if self.require_login && !current.is_public_review() && task.assignee != actor {
            tracing::warn!(
                "'{}' tried to decide review task {} assigned to '{}'",
                actor,
                task.id,
                task.assignee
            );
            return Err(FlowError::Permission {
                user: actor.to_string(),
                task_id: task.id,
            });
        }
        if task.step_key != current.key() {
            return Err(FlowError::Validation(format!(
                "review task {} belongs to step '{}' but workflow {} is at '{}'",
                task.id,
                task.step_key,
                workflow_id,
                current.key()
            )));
        }
        if task.is_finished() {
            return Err(FlowError::Validation(format!(
                "review task {} was already decided",
                task.id
            )));
        }

        if submission.is_transfer() {
            let to = submission
                .transfer_to
                .as_deref()
                .map(str::trim)
                .unwrap_or_default();
            store.reassign(conn, task.id, to).await?;
            tracing::info!(
                "🔀 Review task {} of workflow {} transferred from '{}' to '{}'",
                task.id,
                workflow_id,
                task.assignee,
                to
            );
            let remark = format!("{} transfer to {}", task.step_key, to);
            task.assignee = to.to_string();
            task.updated_at = Utc::now();
            return Ok(SubmitOutcome {
                task,
                transition: None,
                instance: flow.into_instance(),
                remark,
                attachments: Vec::new(),
            });
        }

        if !submission.attachments.is_empty() {
            let Some(attachments) = &self.attachments else {
                return Err(FlowError::Configuration(
                    "submission carries attachments but no attachment store is configured"
                        .to_string(),
                ));
            };
            for attachment in &submission.attachments {
                let stored = attachments
                    .upload(flow.type_name(), flow.id(), attachment)
                    .await
                    .map_err(FlowError::Attachment)?;
                uploaded.push(stored);
            }
        }

        task.conclusion = submission.conclusion;
        task.remark = submission.remark.clone();
        let mut hook_remark = None;

        if let Some(hook) = wt.before_transition() {
            if submission.conclusion.is_approval() {
                let cx = HookContext {
                    actor,
                    conn: &mut *conn,
                    base_context: flow.base_context(),
                    instance: flow.instance(),
                    task: &task,
                    submission,
                    current_tasks: &[],
                };
                hook_remark = hook.run(cx).await.map_err(FlowError::Hook)?;
            }
        }

        store
            .record_conclusion(conn, task.id, task.conclusion, &task.remark)
            .await?;
        task.updated_at = Utc::now();

        let transition = self
            .engine
            .go_next(conn, &mut flow, &submission.remaining_ids)
            .await?;

        if let Some(hook) = wt.after_transition() {
            let cx = HookContext {
                actor,
                conn: &mut *conn,
                base_context: flow.base_context(),
                instance: flow.instance(),
                task: &task,
                submission,
                current_tasks: transition.current_tasks(),
            };
            if let Some(remark) = hook.run(cx).await.map_err(FlowError::Hook)? {
                hook_remark = Some(remark);
            }
        }

        let remark = hook_remark
            .unwrap_or_else(|| format!("{}|{}", task.conclusion.code(), task.remark));
        Ok(SubmitOutcome {
            task,
            transition: Some(transition),
            instance: flow.into_instance(),
            remark,
            attachments: uploaded.clone(),
        })
    }

    /// Replace the business payload; only the creator, and only while in draft
    pub async fn update_data(
        &self,
        workflow_type: &str,
        id: WorkflowId,
        actor: &str,
        data: Value,
    ) -> FlowResult<WorkflowInstance> {
        let wt = self.registry.get(workflow_type)?;
        let mut tx = self.storage.pool().begin().await?;
        let mut instance = self.storage.fetch(&mut *tx, wt.name(), id).await?;

        if instance.creator != actor {
            return Err(FlowError::NotCreator {
                user: actor.to_string(),
                workflow_id: id,
            });
        }
        if instance.status != FlowStatus::Draft {
            return Err(FlowError::Validation(format!(
                "workflow {} can only be edited in draft, it is {:?}",
                id, instance.status
            )));
        }

        self.storage.update_data(&mut *tx, id, &data).await?;
        tx.commit().await?;

        instance.data = data;
        instance.updated_at = Utc::now();
        self.record_audit(actor, &instance, "update", "updated").await;
        Ok(instance)
    }

    /// Close a running instance as timed out (called by an external scheduler)
    pub async fn expire(&self, workflow_type: &str, id: WorkflowId) -> FlowResult<WorkflowInstance> {
        let wt = self.registry.get(workflow_type)?;
        let mut tx = self.storage.pool().begin().await?;
        let mut instance = self.storage.fetch(&mut *tx, wt.name(), id).await?;
        if instance.status != FlowStatus::Running {
            return Err(FlowError::Validation(format!(
                "only running workflows time out, {} is {:?}",
                id, instance.status
            )));
        }
        self.storage
            .update_status(&mut *tx, id, FlowStatus::TimedOut)
            .await?;
        tx.commit().await?;

        tracing::info!("⏰ Workflow {} ({}) timed out", id, workflow_type);
        instance.status = FlowStatus::TimedOut;
        instance.updated_at = Utc::now();
        Ok(instance)
    }

    /// Load an instance bound to its workflow type
    pub async fn load_flow(&self, workflow_type: &str, id: WorkflowId) -> FlowResult<Flow> {
        let wt = self.registry.get(workflow_type)?;
        let instance = self
            .storage
            .get_instance(wt.name(), id)
            .await?
            .ok_or_else(|| {
                FlowError::not_found("workflow instance", format!("{}#{}", workflow_type, id))
            })?;
        Flow::new(instance, wt)
    }

    /// Instance of a registered type; `Ok(None)` when no such row exists
    pub async fn get_instance(
        &self,
        workflow_type: &str,
        id: WorkflowId,
    ) -> FlowResult<Option<WorkflowInstance>> {
        let wt = self.registry.get(workflow_type)?;
        self.storage.get_instance(wt.name(), id).await
    }

    /// Instances of one type, newest first, optionally filtered by status
    ///
    /// `limit` is clamped to `1..=MAX_PAGE_SIZE`.
    pub async fn list_instances(
        &self,
        workflow_type: &str,
        status: Option<FlowStatus>,
        offset: i64,
        limit: i64,
    ) -> FlowResult<Vec<WorkflowInstance>> {
        let wt = self.registry.get(workflow_type)?;
        self.storage
            .list_instances(wt.name(), status, offset, limit)
            .await
    }

    /// Configuration payload of the current step
    pub async fn step_config(
        &self,
        workflow_type: &str,
        id: WorkflowId,
        context: &BaseContext,
    ) -> FlowResult<Option<Value>> {
        let mut flow = self.load_flow(workflow_type, id).await?;
        flow.set_base_context(context.clone());
        let step = flow.current_step()?;
        Ok(flow.step_config(step))
    }

    /// Every reviewer task of an instance across steps, oldest first
    ///
    /// `limit` is clamped to `1..=MAX_PAGE_SIZE`.
    pub async fn task_history(
        &self,
        workflow_type: &str,
        id: WorkflowId,
        offset: i64,
        limit: i64,
    ) -> FlowResult<Vec<ReviewTask>> {
        let flow = self.load_flow(workflow_type, id).await?;
        let limit = if (1..=MAX_PAGE_SIZE).contains(&limit) {
            limit
        } else {
            MAX_PAGE_SIZE
        };

        let mut conn = self.storage.pool().acquire().await?;
        let mut tasks = Vec::new();
        for kind in task_kinds(flow.workflow_type()) {
            tasks.extend(
                ReviewTaskStore::new(kind)
                    .history(&mut *conn, flow.type_name(), id)
                    .await?,
            );
        }
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        Ok(tasks
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit as usize)
            .collect())
    }

    /// Decided tasks of the step before the current one
    ///
    /// Callers pick `remaining_ids` for a partial rollback from this list.
    pub async fn previous_step_reviewers(
        &self,
        workflow_type: &str,
        id: WorkflowId,
    ) -> FlowResult<Vec<ReviewTask>> {
        let flow = self.load_flow(workflow_type, id).await?;
        if !flow.instance().is_started() || flow.instance().is_finished() {
            return Ok(Vec::new());
        }
        let Some(previous) = flow.previous_step()? else {
            return Ok(Vec::new());
        };

        let mut conn = self.storage.pool().acquire().await?;
        ReviewTaskStore::new(previous.task_kind().clone())
            .decided_for_step(&mut *conn, flow.type_name(), id, previous.key())
            .await
    }

    async fn bind(
        &self,
        conn: &mut SqliteConnection,
        wt: &Arc<WorkflowType>,
        id: WorkflowId,
        actor: &str,
        context: &BaseContext,
    ) -> FlowResult<Flow> {
        let instance = self.storage.fetch(conn, wt.name(), id).await?;
        let mut flow = Flow::new(instance, Arc::clone(wt))?;
        let mut context = context.clone();
        if context.actor.is_none() {
            context.actor = Some(actor.to_string());
        }
        flow.set_base_context(context);
        Ok(flow)
    }

    async fn record_audit(&self, user: &str, instance: &WorkflowInstance, action: &str, remark: &str) {
        if remark.is_empty() {
            return;
        }
        let record = AuditRecord {
            user: user.to_string(),
            workflow_type: instance.workflow_type.clone(),
            workflow_id: instance.id,
            action: action.to_string(),
            remark: remark.to_string(),
        };
        if let Err(e) = self.audit.record(record).await {
            tracing::warn!("Failed to record audit entry for workflow {}: {:#}", instance.id, e);
        }
    }

    async fn discard_attachments(&self, uploaded: &[StoredAttachment]) {
        let Some(store) = &self.attachments else {
            return;
        };
        for stored in uploaded {
            if let Err(e) = store.delete(stored).await {
                tracing::error!(
                    "Failed to delete attachment '{}' of a failed submission: {:#}",
                    stored.location,
                    e
                );
            }
        }
    }
}

/// Distinct task tables used by the steps of a workflow type
fn task_kinds(wt: &WorkflowType) -> Vec<TaskKind> {
    let mut kinds: Vec<TaskKind> = Vec::new();
    for step in wt.steps().steps() {
        if !kinds.contains(step.task_kind()) {
            kinds.push(step.task_kind().clone());
        }
    }
    kinds
}

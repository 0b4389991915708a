/// Step transition engine
///
/// Re-evaluates the reviewer tasks of an instance's current step and moves the
/// instance accordingly: hold, advance to the next step, roll back to the
/// previous one, finish, or return to draft. Every write goes through the
/// connection it is handed, so the caller's transaction makes the whole
/// transition atomic.

use crate::error::{FlowError, FlowResult};
use crate::workflow::{
    lifecycle::Flow,
    step::StepDefinition,
    storage::WorkflowStorage,
    tasks::ReviewTaskStore,
    types::{FlowStatus, NewReviewTask, ReviewTask, TaskId, FINISHED_STEP, NOT_STARTED},
};
use sqlx::SqliteConnection;

/// Aggregate of one step's reviewer decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tally {
    pub total: usize,
    pub passed: usize,
    pub rejected: usize,
}

/// What the aggregate of a step calls for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Hold,
    Advance,
    Rollback,
}

impl Tally {
    pub fn from_tasks(tasks: &[ReviewTask]) -> Self {
        let mut tally = Tally {
            total: tasks.len(),
            ..Default::default()
        };
        for task in tasks.iter().filter(|t| t.is_finished()) {
            if task.is_approved() {
                tally.passed += 1;
            } else {
                tally.rejected += 1;
            }
        }
        tally
    }

    /// Truncating integer percentage of approvals
    pub fn pass_pct(&self) -> u32 {
        percentage(self.passed, self.total)
    }

    /// Truncating integer percentage of non-approving decisions
    pub fn reject_pct(&self) -> u32 {
        percentage(self.rejected, self.total)
    }

    /// Advance once approvals reach `threshold`, roll back once rejections
    /// exceed `100 - threshold`, hold otherwise
    pub fn decide(&self, threshold: u32) -> Decision {
        let threshold = threshold.min(100);
        if self.pass_pct() >= threshold {
            Decision::Advance
        } else if self.reject_pct() > 100 - threshold {
            Decision::Rollback
        } else {
            Decision::Hold
        }
    }
}

fn percentage(count: usize, total: usize) -> u32 {
    if total == 0 {
        return 0;
    }
    (count * 100 / total) as u32
}

/// Result of one engine evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    /// Reviewers are still pending; nothing moved
    Held { step: String, tasks: Vec<ReviewTask> },
    /// Entered `to`; `from` is empty when the instance was just started
    Advanced {
        from: String,
        to: String,
        tasks: Vec<ReviewTask>,
    },
    /// Went back to `to`, whose open tasks are in `tasks`
    RolledBack {
        from: String,
        to: String,
        tasks: Vec<ReviewTask>,
    },
    /// Passed the last step
    Finished { from: String },
    /// Rejected at the first step and handed back to the creator
    ReturnedToDraft { from: String },
}

impl TransitionOutcome {
    /// Tasks of the step the instance now waits on (empty when it waits on none)
    pub fn current_tasks(&self) -> &[ReviewTask] {
        match self {
            TransitionOutcome::Held { tasks, .. }
            | TransitionOutcome::Advanced { tasks, .. }
            | TransitionOutcome::RolledBack { tasks, .. } => tasks,
            _ => &[],
        }
    }

    /// False only for `Held`
    pub fn moved(&self) -> bool {
        !matches!(self, TransitionOutcome::Held { .. })
    }
}

/// Decides and applies step transitions
#[derive(Debug, Clone)]
pub struct TransitionEngine {
    storage: WorkflowStorage,
}

impl TransitionEngine {
    pub fn new(storage: WorkflowStorage) -> Self {
        Self { storage }
    }

    /// Move a not-started (or returned-to-draft) instance into its first step
    pub async fn enter_first_step(
        &self,
        conn: &mut SqliteConnection,
        flow: &mut Flow,
    ) -> FlowResult<TransitionOutcome> {
        if flow.instance().current_step != NOT_STARTED {
            return Err(FlowError::Validation(format!(
                "workflow {} is already at step '{}'",
                flow.id(),
                flow.instance().current_step
            )));
        }
        let first = flow
            .next_step()?
            .cloned()
            .ok_or_else(|| FlowError::Configuration(format!("workflow type '{}' has no steps", flow.type_name())))?;

        let tasks = self.seed_step(conn, flow, &first).await?;
        self.storage
            .update_position(conn, flow.id(), NOT_STARTED, first.key(), FlowStatus::Running)
            .await?;
        flow.set_position(first.key(), FlowStatus::Running);

        tracing::info!(
            "▶️ Workflow {} ({}) entered step '{}' with {} reviewers",
            flow.id(),
            flow.type_name(),
            first.key(),
            tasks.len()
        );
        Ok(TransitionOutcome::Advanced {
            from: NOT_STARTED.to_string(),
            to: first.key().to_string(),
            tasks,
        })
    }

    /// Re-evaluate the current step and transition if its aggregate is decisive
    ///
    /// `remaining_ids` only matters on rollback: when non-empty, the listed
    /// tasks of the previous step are reopened for their reviewers instead of
    /// re-seeding that step, and its other decisions stand.
    pub async fn go_next(
        &self,
        conn: &mut SqliteConnection,
        flow: &mut Flow,
        remaining_ids: &[TaskId],
    ) -> FlowResult<TransitionOutcome> {
        let current = flow.current_step()?.clone();
        let current_store = ReviewTaskStore::new(current.task_kind().clone());
        let tasks = current_store
            .load_for_step(conn, flow.type_name(), flow.id(), current.key())
            .await?;

        let tally = Tally::from_tasks(&tasks);
        let threshold = current.pass_rate();
        let decision = tally.decide(threshold);
        tracing::debug!(
            "Workflow {} step '{}': {}/{} passed ({}%), {} rejected ({}%), threshold {} -> {:?}",
            flow.id(),
            current.key(),
            tally.passed,
            tally.total,
            tally.pass_pct(),
            tally.rejected,
            tally.reject_pct(),
            threshold,
            decision
        );

        match decision {
            Decision::Hold => Ok(TransitionOutcome::Held {
                step: current.key().to_string(),
                tasks,
            }),
            Decision::Advance => self.advance(conn, flow, &current).await,
            Decision::Rollback => self.rollback(conn, flow, &current, &current_store, remaining_ids).await,
        }
    }

    async fn advance(
        &self,
        conn: &mut SqliteConnection,
        flow: &mut Flow,
        current: &StepDefinition,
    ) -> FlowResult<TransitionOutcome> {
        let Some(next) = flow.next_step()?.cloned() else {
            self.storage
                .update_position(conn, flow.id(), current.key(), FINISHED_STEP, FlowStatus::Finished)
                .await?;
            flow.set_position(FINISHED_STEP, FlowStatus::Finished);
            tracing::info!("🏁 Workflow {} ({}) finished after step '{}'", flow.id(), flow.type_name(), current.key());
            return Ok(TransitionOutcome::Finished {
                from: current.key().to_string(),
            });
        };

        let tasks = self.seed_step(conn, flow, &next).await?;
        self.storage
            .update_position(conn, flow.id(), current.key(), next.key(), FlowStatus::Running)
            .await?;
        flow.set_position(next.key(), FlowStatus::Running);

        tracing::info!(
            "⏩ Workflow {} ({}) advanced '{}' -> '{}'",
            flow.id(),
            flow.type_name(),
            current.key(),
            next.key()
        );
        Ok(TransitionOutcome::Advanced {
            from: current.key().to_string(),
            to: next.key().to_string(),
            tasks,
        })
    }

    async fn rollback(
        &self,
        conn: &mut SqliteConnection,
        flow: &mut Flow,
        current: &StepDefinition,
        current_store: &ReviewTaskStore,
        remaining_ids: &[TaskId],
    ) -> FlowResult<TransitionOutcome> {
        let Some(previous) = flow.previous_step()?.cloned() else {
            current_store
                .clear(conn, flow.type_name(), flow.id(), &[current.key()], &[])
                .await?;
            self.after_clear(conn, flow, current).await?;
            self.storage
                .update_position(conn, flow.id(), current.key(), NOT_STARTED, FlowStatus::Draft)
                .await?;
            flow.set_position(NOT_STARTED, FlowStatus::Draft);
            tracing::info!(
                "↩️ Workflow {} ({}) rejected at first step '{}', returned to draft",
                flow.id(),
                flow.type_name(),
                current.key()
            );
            return Ok(TransitionOutcome::ReturnedToDraft {
                from: current.key().to_string(),
            });
        };

        let previous_store = ReviewTaskStore::new(previous.task_kind().clone());
        let step_keys = [current.key(), previous.key()];

        let tasks = if remaining_ids.is_empty() {
            current_store
                .clear(conn, flow.type_name(), flow.id(), &step_keys, &[])
                .await?;
            if previous_store.kind() != current_store.kind() {
                previous_store
                    .clear(conn, flow.type_name(), flow.id(), &[previous.key()], &[])
                    .await?;
            }
            self.after_clear(conn, flow, current).await?;
            self.seed_step(conn, flow, &previous).await?
        } else {
            let mut ids = remaining_ids.to_vec();
            ids.sort_unstable();
            ids.dedup();

            let kept = previous_store.load(conn, &ids).await?;
            let belongs = |t: &ReviewTask| {
                t.workflow_id == flow.id()
                    && t.workflow_type == flow.type_name()
                    && t.step_key == previous.key()
            };
            if kept.len() != ids.len() || !kept.iter().all(belongs) {
                return Err(FlowError::Validation(format!(
                    "remaining ids {:?} are not all tasks of step '{}' of workflow {}",
                    ids,
                    previous.key(),
                    flow.id()
                )));
            }

            // preserved ids are only meaningful in the table they came from
            if previous_store.kind() == current_store.kind() {
                current_store
                    .clear(conn, flow.type_name(), flow.id(), &step_keys, &ids)
                    .await?;
            } else {
                current_store
                    .clear(conn, flow.type_name(), flow.id(), &[current.key()], &[])
                    .await?;
            }
            self.after_clear(conn, flow, current).await?;
            previous_store.reopen(conn, &ids).await?;
            previous_store.load(conn, &ids).await?
        };

        self.storage
            .update_position(conn, flow.id(), current.key(), previous.key(), FlowStatus::Running)
            .await?;
        flow.set_position(previous.key(), FlowStatus::Running);

        tracing::info!(
            "⏪ Workflow {} ({}) rolled back '{}' -> '{}' ({} reviewers to decide)",
            flow.id(),
            flow.type_name(),
            current.key(),
            previous.key(),
            tasks.len()
        );
        Ok(TransitionOutcome::RolledBack {
            from: current.key().to_string(),
            to: previous.key().to_string(),
            tasks,
        })
    }

    /// Let a rejected step reset the business data it owns
    async fn after_clear(
        &self,
        conn: &mut SqliteConnection,
        flow: &Flow,
        step: &StepDefinition,
    ) -> FlowResult<()> {
        let Some(hook) = step.on_clear() else {
            return Ok(());
        };
        tracing::debug!("Running clear hook of step '{}' for workflow {}", step.key(), flow.id());
        hook.on_clear(conn, flow.type_name(), flow.id())
            .await
            .map_err(FlowError::Hook)
    }

    /// Create one open task per default assignee of `step`
    async fn seed_step(
        &self,
        conn: &mut SqliteConnection,
        flow: &Flow,
        step: &StepDefinition,
    ) -> FlowResult<Vec<ReviewTask>> {
        let assignees = flow.default_assignees(step);
        if assignees.is_empty() {
            return Err(FlowError::Configuration(format!(
                "step '{}' of workflow type '{}' resolves to no reviewers for workflow {}",
                step.key(),
                flow.type_name(),
                flow.id()
            )));
        }
        let new_tasks: Vec<NewReviewTask> = assignees
            .into_iter()
            .map(|assignee| NewReviewTask {
                assignee,
                step_key: step.key().to_string(),
                workflow_id: flow.id(),
                workflow_type: flow.type_name().to_string(),
            })
            .collect();
        ReviewTaskStore::new(step.task_kind().clone())
            .create(conn, &new_tasks)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::Conclusion;
    use chrono::Utc;
    use proptest::prelude::*;

    fn task(conclusion: Conclusion) -> ReviewTask {
        ReviewTask {
            id: 1,
            assignee: "alice".to_string(),
            step_key: "A".to_string(),
            workflow_id: 1,
            workflow_type: "purchase".to_string(),
            conclusion,
            remark: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn tally(passed: usize, rejected: usize, total: usize) -> Tally {
        Tally { total, passed, rejected }
    }

    #[test]
    fn tally_counts_risky_approvals_as_passes() {
        let tasks = vec![
            task(Conclusion::Approved),
            task(Conclusion::ApprovedWithRisk),
            task(Conclusion::Rejected),
            task(Conclusion::Pending),
        ];
        assert_eq!(Tally::from_tasks(&tasks), tally(2, 1, 4));
    }

    #[test]
    fn single_reviewer_is_decisive() {
        assert_eq!(tally(1, 0, 1).decide(100), Decision::Advance);
        assert_eq!(tally(0, 1, 1).decide(100), Decision::Rollback);
        assert_eq!(tally(0, 0, 1).decide(100), Decision::Hold);
    }

    #[test]
    fn half_threshold_with_four_reviewers() {
        assert_eq!(tally(2, 0, 4).decide(50), Decision::Advance);
        assert_eq!(tally(2, 2, 4).decide(50), Decision::Advance);
        assert_eq!(tally(1, 2, 4).decide(50), Decision::Hold);
        assert_eq!(tally(1, 3, 4).decide(50), Decision::Rollback);
        assert_eq!(tally(0, 3, 4).decide(50), Decision::Rollback);
    }

    #[test]
    fn split_vote_below_sixty_rolls_back() {
        assert_eq!(tally(1, 1, 2).decide(60), Decision::Rollback);
    }

    #[test]
    fn percentages_truncate() {
        let t = tally(1, 2, 3);
        assert_eq!(t.pass_pct(), 33);
        assert_eq!(t.reject_pct(), 66);
        assert_eq!(t.decide(33), Decision::Advance);
        assert_eq!(t.decide(34), Decision::Hold);
        assert_eq!(t.decide(35), Decision::Rollback);
        assert_eq!(tally(1, 0, 3).decide(34), Decision::Hold);
    }

    #[test]
    fn outcome_tasks() {
        assert!(TransitionOutcome::Finished { from: "B".into() }.current_tasks().is_empty());
        let held = TransitionOutcome::Held {
            step: "A".into(),
            tasks: vec![task(Conclusion::Approved), task(Conclusion::Pending)],
        };
        assert!(!held.moved());
        assert_eq!(held.current_tasks().len(), 2);
        let advanced = TransitionOutcome::Advanced {
            from: "A".into(),
            to: "B".into(),
            tasks: vec![task(Conclusion::Pending)],
        };
        assert_eq!(advanced.current_tasks().len(), 1);
        assert!(advanced.moved());
    }

    fn counts() -> impl Strategy<Value = (usize, usize, usize)> {
        (1usize..12).prop_flat_map(|total| {
            (0..=total).prop_flat_map(move |passed| (Just(passed), 0..=total - passed, Just(total)))
        })
    }

    proptest! {
        #[test]
        fn unanimity_required_at_full_threshold((passed, rejected, total) in counts()) {
            let decision = tally(passed, rejected, total).decide(100);
            prop_assert_eq!(decision == Decision::Advance, passed == total);
            prop_assert_eq!(decision == Decision::Rollback, rejected >= 1);
        }

        #[test]
        fn decision_follows_truncated_percentages(
            (passed, rejected, total) in counts(),
            threshold in 1u32..=100,
        ) {
            let t = tally(passed, rejected, total);
            let pass_pct = (passed * 100 / total) as u32;
            let reject_pct = (rejected * 100 / total) as u32;
            let expected = if pass_pct >= threshold {
                Decision::Advance
            } else if reject_pct > 100 - threshold {
                Decision::Rollback
            } else {
                Decision::Hold
            };
            prop_assert_eq!(t.decide(threshold), expected);
        }

        #[test]
        fn advance_and_rollback_never_overlap(
            (passed, rejected, total) in counts(),
            threshold in 1u32..=100,
        ) {
            let t = tally(passed, rejected, total);
            prop_assert!(!(t.pass_pct() >= threshold && t.reject_pct() > 100 - threshold));
        }
    }
}

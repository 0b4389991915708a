/// Workflow instance lifecycle
///
/// A `Flow` pairs a loaded instance with its registered workflow type and the
/// ambient caller context. It answers the step lookups the transition engine
/// needs (current, next, previous) and is the only place instance position
/// changes are applied in memory.

use crate::error::{FlowError, FlowResult};
use crate::workflow::{
    registry::WorkflowType,
    step::StepDefinition,
    types::{FlowStatus, WorkflowId, WorkflowInstance, FINISHED_STEP, NOT_STARTED},
};
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};

/// Ambient caller context handed to attribute accessors, config providers and hooks
#[derive(Debug, Clone, Default)]
pub struct BaseContext {
    /// Identity of the acting user, as supplied by the session collaborator
    pub actor: Option<String>,
    pub locale: Option<String>,
    pub values: HashMap<String, Value>,
}

impl BaseContext {
    pub fn for_actor(actor: impl Into<String>) -> Self {
        Self {
            actor: Some(actor.into()),
            ..Default::default()
        }
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }

    pub fn with_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }
}

/// A workflow instance bound to its type for the duration of one operation
#[derive(Debug, Clone)]
pub struct Flow {
    instance: WorkflowInstance,
    workflow_type: Arc<WorkflowType>,
    context: BaseContext,
}

impl Flow {
    pub fn new(instance: WorkflowInstance, workflow_type: Arc<WorkflowType>) -> FlowResult<Self> {
        if instance.workflow_type != workflow_type.name() {
            return Err(FlowError::Validation(format!(
                "workflow {} is of type '{}', not '{}'",
                instance.id,
                instance.workflow_type,
                workflow_type.name()
            )));
        }
        Ok(Self {
            instance,
            workflow_type,
            context: BaseContext::default(),
        })
    }

    pub fn id(&self) -> WorkflowId {
        self.instance.id
    }

    pub fn instance(&self) -> &WorkflowInstance {
        &self.instance
    }

    pub fn into_instance(self) -> WorkflowInstance {
        self.instance
    }

    pub fn workflow_type(&self) -> &WorkflowType {
        &self.workflow_type
    }

    pub fn type_name(&self) -> &str {
        self.workflow_type.name()
    }

    /// Inject the ambient caller context used by resolver callbacks
    pub fn set_base_context(&mut self, context: BaseContext) {
        self.context = context;
    }

    pub fn base_context(&self) -> &BaseContext {
        &self.context
    }

    /// Step the instance currently waits on
    pub fn current_step(&self) -> FlowResult<&StepDefinition> {
        match self.instance.current_step.as_str() {
            NOT_STARTED => Err(FlowError::Validation(format!(
                "workflow {} has not entered its first step",
                self.instance.id
            ))),
            FINISHED_STEP => Err(FlowError::Validation(format!(
                "workflow {} has already passed its last step",
                self.instance.id
            ))),
            key => self
                .workflow_type
                .steps()
                .get(key)
                .ok_or_else(|| FlowError::not_found("step", key)),
        }
    }

    /// Lexicographically next step, the first step when not started, `None` at the end
    pub fn next_step(&self) -> FlowResult<Option<&StepDefinition>> {
        self.workflow_type
            .steps()
            .next_after(&self.instance.current_step)
    }

    /// Lexicographically previous step; `None` at the first key or when not started
    pub fn previous_step(&self) -> FlowResult<Option<&StepDefinition>> {
        self.workflow_type
            .steps()
            .previous_before(&self.instance.current_step)
    }

    /// Reviewers a step is seeded with for this instance
    pub fn default_assignees(&self, step: &StepDefinition) -> Vec<String> {
        step.default_assignees(self.workflow_type.attributes(), &self.instance, &self.context)
    }

    pub fn step_config(&self, step: &StepDefinition) -> Option<Value> {
        step.config_schema(&self.instance, &self.context)
    }

    /// Apply a persisted position change to the in-memory instance
    pub(crate) fn set_position(&mut self, step_key: &str, status: FlowStatus) {
        self.instance.current_step = step_key.to_string();
        self.instance.status = status;
        self.instance.updated_at = chrono::Utc::now();
    }
}

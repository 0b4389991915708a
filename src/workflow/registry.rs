/// Workflow type registry
///
/// Maps a workflow type name to its definition (steps, attribute accessors,
/// hooks). The registry is assembled once at start-up through
/// `WorkflowTypeRegistry::builder()` and is read-only afterwards; share it
/// behind an `Arc` and read it concurrently without locking.

use crate::error::{FlowError, FlowResult};
use crate::runtime::hooks::TransitionHook;
use crate::workflow::{
    attributes::AttributeMap,
    step::{StepRegistry, TaskKind},
    types::FlowStatus,
};
use std::{collections::HashMap, fmt, sync::Arc};

/// Definition of one kind of workflow
///
/// Optional capabilities (hooks, attribute accessors) are plain fields rather
/// than traits an instance may or may not implement.
#[derive(Clone)]
pub struct WorkflowType {
    name: String,
    steps: StepRegistry,
    attributes: AttributeMap,
    /// Status given to freshly created instances (Draft or Running)
    initial_status: FlowStatus,
    before_transition: Option<Arc<dyn TransitionHook>>,
    after_transition: Option<Arc<dyn TransitionHook>>,
}

impl fmt::Debug for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowType")
            .field("name", &self.name)
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .field("attributes", &self.attributes)
            .field("initial_status", &self.initial_status)
            .field("before_transition", &self.before_transition.is_some())
            .field("after_transition", &self.after_transition.is_some())
            .finish()
    }
}

impl WorkflowType {
    pub fn new(name: impl Into<String>, steps: StepRegistry) -> Self {
        Self {
            name: name.into(),
            steps,
            attributes: AttributeMap::new(),
            initial_status: FlowStatus::Draft,
            before_transition: None,
            after_transition: None,
        }
    }

    pub fn with_attributes(mut self, attributes: AttributeMap) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_initial_status(mut self, status: FlowStatus) -> Self {
        self.initial_status = status;
        self
    }

    /// Runs inside the transaction after validation, before the conclusion is stored
    pub fn with_before_transition(mut self, hook: Arc<dyn TransitionHook>) -> Self {
        self.before_transition = Some(hook);
        self
    }

    /// Runs inside the transaction after the transition engine
    pub fn with_after_transition(mut self, hook: Arc<dyn TransitionHook>) -> Self {
        self.after_transition = Some(hook);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &StepRegistry {
        &self.steps
    }

    pub fn attributes(&self) -> &AttributeMap {
        &self.attributes
    }

    pub fn initial_status(&self) -> FlowStatus {
        self.initial_status
    }

    pub fn before_transition(&self) -> Option<&Arc<dyn TransitionHook>> {
        self.before_transition.as_ref()
    }

    pub fn after_transition(&self) -> Option<&Arc<dyn TransitionHook>> {
        self.after_transition.as_ref()
    }
}

/// Process-wide catalogue of workflow types
#[derive(Debug, Default)]
pub struct WorkflowTypeRegistry {
    types: HashMap<String, Arc<WorkflowType>>,
}

/// Start-up registration of workflow types
#[derive(Debug, Default)]
pub struct WorkflowTypeRegistryBuilder {
    types: HashMap<String, Arc<WorkflowType>>,
}

impl WorkflowTypeRegistryBuilder {
    /// Register a workflow type
    ///
    /// # Panics
    ///
    /// On an empty name, a non Draft/Running initial status, or a second
    /// registration under the same name. A misconfigured process must not start.
    pub fn register(mut self, workflow_type: WorkflowType) -> Self {
        let name = workflow_type.name().to_string();
        if name.is_empty() {
            panic!("workflow registry: cannot register a workflow type without a name");
        }
        if !matches!(
            workflow_type.initial_status(),
            FlowStatus::Draft | FlowStatus::Running
        ) {
            panic!(
                "workflow registry: type '{}' must start as Draft or Running, not {:?}",
                name,
                workflow_type.initial_status()
            );
        }
        if self.types.contains_key(&name) {
            panic!("workflow registry: type '{}' registered twice", name);
        }
        for step in workflow_type.steps().steps() {
            for attribute in step.assignee_attributes() {
                if !workflow_type.attributes().contains(attribute) {
                    tracing::warn!(
                        "Step '{}' of workflow type '{}' names unknown attribute '{}'",
                        step.key(),
                        name,
                        attribute
                    );
                }
            }
        }
        tracing::info!(
            "Registered workflow type '{}' with {} steps",
            name,
            workflow_type.steps().len()
        );
        self.types.insert(name, Arc::new(workflow_type));
        self
    }

    pub fn build(self) -> WorkflowTypeRegistry {
        WorkflowTypeRegistry { types: self.types }
    }
}

impl WorkflowTypeRegistry {
    pub fn builder() -> WorkflowTypeRegistryBuilder {
        WorkflowTypeRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> FlowResult<Arc<WorkflowType>> {
        self.types
            .get(name)
            .cloned()
            .ok_or_else(|| FlowError::not_found("workflow type", name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.keys().cloned().collect();
        names.sort();
        names
    }

    /// Distinct task tables used by any registered step
    pub fn task_kinds(&self) -> Vec<TaskKind> {
        let mut kinds: Vec<TaskKind> = Vec::new();
        for workflow_type in self.types.values() {
            for step in workflow_type.steps().steps() {
                if !kinds.contains(step.task_kind()) {
                    kinds.push(step.task_kind().clone());
                }
            }
        }
        kinds.sort_by(|a, b| a.table().cmp(b.table()));
        kinds
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::step::StepDefinition;

    fn steps() -> StepRegistry {
        StepRegistry::builder()
            .step(StepDefinition::new("A"))
            .step(
                StepDefinition::new("B")
                    .with_task_kind(TaskKind::new("finance_reviews").unwrap()),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn lookup_and_task_kinds() {
        let registry = WorkflowTypeRegistry::builder()
            .register(WorkflowType::new("purchase", steps()))
            .register(WorkflowType::new("leave", steps()).with_initial_status(FlowStatus::Running))
            .build();
        assert_eq!(registry.names(), vec!["leave", "purchase"]);
        assert_eq!(registry.get("leave").unwrap().initial_status(), FlowStatus::Running);
        assert!(matches!(registry.get("nope"), Err(FlowError::NotFound { .. })));
        let tables: Vec<String> = registry
            .task_kinds()
            .iter()
            .map(|k| k.table().to_string())
            .collect();
        assert_eq!(tables, vec!["finance_reviews", "step_handlers"]);
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_registration_panics() {
        WorkflowTypeRegistry::builder()
            .register(WorkflowType::new("purchase", steps()))
            .register(WorkflowType::new("purchase", steps()));
    }

    #[test]
    #[should_panic(expected = "must start as Draft or Running")]
    fn terminal_initial_status_panics() {
        WorkflowTypeRegistry::builder()
            .register(WorkflowType::new("purchase", steps()).with_initial_status(FlowStatus::Finished));
    }
}

/// Step definitions and the per-workflow-type step registry
///
/// Steps are keyed by string. The sequence used for "next" and "previous" is
/// the lexicographic order of the keys (so "10" sorts before "2"); an
/// optional designated first step only changes where a fresh instance enters.

use crate::error::{validate_identifier, FlowError, FlowResult};
use crate::runtime::hooks::StepClearHook;
use crate::workflow::{
    attributes::AttributeMap,
    lifecycle::BaseContext,
    types::{WorkflowInstance, FINISHED_STEP, NOT_STARTED},
};
use serde_json::Value;
use std::{collections::BTreeMap, fmt, sync::Arc};

/// Default table backing reviewer tasks
pub const DEFAULT_TASK_TABLE: &str = "step_handlers";

/// Which task record table a step's reviewer tasks live in
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKind {
    table: String,
}

impl TaskKind {
    pub fn new(table: impl Into<String>) -> FlowResult<Self> {
        let table = table.into();
        validate_identifier(&table)?;
        Ok(Self { table })
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

impl Default for TaskKind {
    fn default() -> Self {
        Self {
            table: DEFAULT_TASK_TABLE.to_string(),
        }
    }
}

pub type ConfigProvider = Arc<dyn Fn(&WorkflowInstance, &BaseContext) -> Value + Send + Sync>;

/// Configuration payload a UI needs to act on a step
#[derive(Clone, Default)]
pub enum StepConfig {
    #[default]
    None,
    Static(Value),
    Computed(ConfigProvider),
}

impl fmt::Debug for StepConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepConfig::None => f.write_str("None"),
            StepConfig::Static(v) => f.debug_tuple("Static").field(v).finish(),
            StepConfig::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

/// One named stage requiring reviewer decisions
#[derive(Clone)]
pub struct StepDefinition {
    key: String,
    /// 0 means "unset" and is read as 100
    pass_rate: u32,
    task_kind: TaskKind,
    /// Attribute names resolved into default reviewers
    assignee_attributes: Vec<String>,
    config: StepConfig,
    /// Anyone may decide tasks of a public review step
    public_review: bool,
    /// Runs when the step is rejected and its tasks are cleared
    on_clear: Option<Arc<dyn StepClearHook>>,
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("key", &self.key)
            .field("pass_rate", &self.pass_rate)
            .field("task_kind", &self.task_kind)
            .field("assignee_attributes", &self.assignee_attributes)
            .field("config", &self.config)
            .field("public_review", &self.public_review)
            .field("on_clear", &self.on_clear.is_some())
            .finish()
    }
}

impl StepDefinition {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            pass_rate: 0,
            task_kind: TaskKind::default(),
            assignee_attributes: Vec::new(),
            config: StepConfig::None,
            public_review: false,
            on_clear: None,
        }
    }

    pub fn with_pass_rate(mut self, rate: u32) -> Self {
        self.pass_rate = rate;
        self
    }

    pub fn with_task_kind(mut self, kind: TaskKind) -> Self {
        self.task_kind = kind;
        self
    }

    /// Comma-separated attribute names, e.g. `"owner.manager,reviewers"`
    pub fn with_assignees_from(mut self, attributes: &str) -> Self {
        self.assignee_attributes = attributes
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .collect();
        self
    }

    pub fn with_static_config(mut self, config: Value) -> Self {
        self.config = StepConfig::Static(config);
        self
    }

    pub fn with_computed_config<F>(mut self, provider: F) -> Self
    where
        F: Fn(&WorkflowInstance, &BaseContext) -> Value + Send + Sync + 'static,
    {
        self.config = StepConfig::Computed(Arc::new(provider));
        self
    }

    pub fn public_review(mut self, public: bool) -> Self {
        self.public_review = public;
        self
    }

    pub fn with_on_clear(mut self, hook: Arc<dyn StepClearHook>) -> Self {
        self.on_clear = Some(hook);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Percentage of reviewers that must approve; 100 when unset
    pub fn pass_rate(&self) -> u32 {
        if self.pass_rate == 0 {
            100
        } else {
            self.pass_rate
        }
    }

    pub fn task_kind(&self) -> &TaskKind {
        &self.task_kind
    }

    pub fn assignee_attributes(&self) -> &[String] {
        &self.assignee_attributes
    }

    pub fn is_public_review(&self) -> bool {
        self.public_review
    }

    pub fn on_clear(&self) -> Option<&Arc<dyn StepClearHook>> {
        self.on_clear.as_ref()
    }

    /// Reviewer identities seeded into this step's tasks
    pub fn default_assignees(
        &self,
        attributes: &AttributeMap,
        instance: &WorkflowInstance,
        context: &BaseContext,
    ) -> Vec<String> {
        attributes.identities(&self.assignee_attributes, instance, context)
    }

    /// Side-effect free
    pub fn config_schema(&self, instance: &WorkflowInstance, context: &BaseContext) -> Option<Value> {
        match &self.config {
            StepConfig::None => None,
            StepConfig::Static(v) => Some(v.clone()),
            StepConfig::Computed(provider) => Some(provider(instance, context)),
        }
    }
}

/// Ordered catalogue of the steps of one workflow type
#[derive(Debug, Clone)]
pub struct StepRegistry {
    steps: BTreeMap<String, StepDefinition>,
    first_step: Option<String>,
}

/// Collects steps and validates them into a `StepRegistry`
#[derive(Debug, Default)]
pub struct StepRegistryBuilder {
    steps: Vec<StepDefinition>,
    first_step: Option<String>,
}

impl StepRegistryBuilder {
    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    /// Enter fresh instances at `key` instead of the lowest key
    pub fn first_step(mut self, key: impl Into<String>) -> Self {
        self.first_step = Some(key.into());
        self
    }

    pub fn build(self) -> FlowResult<StepRegistry> {
        if self.steps.is_empty() {
            return Err(FlowError::Configuration(
                "a workflow needs at least one step".to_string(),
            ));
        }
        let mut steps = BTreeMap::new();
        for step in self.steps {
            let key = step.key().to_string();
            if key == NOT_STARTED || key == FINISHED_STEP {
                return Err(FlowError::Configuration(format!(
                    "step key '{}' is reserved",
                    key
                )));
            }
            if step.pass_rate > 100 {
                return Err(FlowError::Configuration(format!(
                    "pass rate {} of step '{}' exceeds 100",
                    step.pass_rate, key
                )));
            }
            if steps.insert(key.clone(), step).is_some() {
                return Err(FlowError::Configuration(format!(
                    "step '{}' registered twice",
                    key
                )));
            }
        }
        if let Some(first) = &self.first_step {
            if !steps.contains_key(first) {
                return Err(FlowError::Configuration(format!(
                    "designated first step '{}' is not registered",
                    first
                )));
            }
        }
        warn_on_numeric_ordering(&steps);
        Ok(StepRegistry {
            steps,
            first_step: self.first_step,
        })
    }
}

/// Numeric keys of different widths do not sort numerically
fn warn_on_numeric_ordering(steps: &BTreeMap<String, StepDefinition>) {
    let all_numeric = steps
        .keys()
        .all(|k| k.chars().all(|c| c.is_ascii_digit()));
    let mut widths = steps.keys().map(String::len);
    let first_width = widths.next();
    let mixed_widths = widths.any(|w| Some(w) != first_width);
    if all_numeric && mixed_widths {
        let order: Vec<&String> = steps.keys().collect();
        tracing::warn!(
            "Numeric step keys of mixed width are ordered lexicographically: {:?}",
            order
        );
    }
}

impl StepRegistry {
    pub fn builder() -> StepRegistryBuilder {
        StepRegistryBuilder::default()
    }

    pub fn get(&self, key: &str) -> Option<&StepDefinition> {
        self.steps.get(key)
    }

    /// Step entered by a fresh instance
    pub fn first(&self) -> Option<&StepDefinition> {
        self.first_step
            .as_deref()
            .and_then(|key| self.steps.get(key))
            .or_else(|| self.steps.values().next())
    }

    /// Step following `key`, or the first step when `key` is not started
    ///
    /// `Ok(None)` at the last key; unknown keys are an error.
    pub fn next_after(&self, key: &str) -> FlowResult<Option<&StepDefinition>> {
        if key == NOT_STARTED {
            return self
                .first()
                .map(Some)
                .ok_or_else(|| FlowError::Configuration("workflow has no steps".to_string()));
        }
        if !self.steps.contains_key(key) {
            return Err(FlowError::not_found("step", key));
        }
        let next = self
            .steps
            .range::<str, _>((std::ops::Bound::Excluded(key), std::ops::Bound::Unbounded))
            .next()
            .map(|(_, step)| step);
        Ok(next)
    }

    /// Step preceding `key`; `Ok(None)` at the first key or before the first step
    pub fn previous_before(&self, key: &str) -> FlowResult<Option<&StepDefinition>> {
        if key == NOT_STARTED {
            return Ok(None);
        }
        if !self.steps.contains_key(key) {
            return Err(FlowError::not_found("step", key));
        }
        let previous = self
            .steps
            .range::<str, _>((std::ops::Bound::Unbounded, std::ops::Bound::Excluded(key)))
            .next_back()
            .map(|(_, step)| step);
        Ok(previous)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.steps.keys().map(String::as_str)
    }

    pub fn steps(&self) -> impl Iterator<Item = &StepDefinition> {
        self.steps.values()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

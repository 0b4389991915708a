/// Attribute capability map used to resolve default reviewers
///
/// Each workflow type registers the attributes its steps may name, keyed by
/// attribute name (dotted names such as "owner.manager" are just keys). A step
/// lists attribute names; the resolved values become the reviewer identities
/// seeded into the step's tasks.

use crate::workflow::{lifecycle::BaseContext, types::WorkflowInstance};
use serde_json::Value;
use std::{collections::HashMap, fmt, sync::Arc};

/// Accessor returning the value of one attribute for an instance
pub type AttributeAccessor =
    Arc<dyn Fn(&WorkflowInstance, &BaseContext) -> Option<Value> + Send + Sync>;

/// Name of the built-in accessor returning the instance creator
pub const CREATOR_ATTRIBUTE: &str = "creator";

/// Explicit `{name: accessor}` map for one workflow type
#[derive(Clone, Default)]
pub struct AttributeMap {
    accessors: HashMap<String, AttributeAccessor>,
}

impl fmt::Debug for AttributeMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.accessors.keys().collect();
        names.sort();
        f.debug_struct("AttributeMap").field("names", &names).finish()
    }
}

impl AttributeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an accessor under `name`, replacing any previous one
    pub fn with<F>(mut self, name: impl Into<String>, accessor: F) -> Self
    where
        F: Fn(&WorkflowInstance, &BaseContext) -> Option<Value> + Send + Sync + 'static,
    {
        self.accessors.insert(name.into(), Arc::new(accessor));
        self
    }

    /// Register an accessor that reads the dotted `path` from the instance's data
    ///
    /// `with_data_path("owner.manager")` reads `data["owner"]["manager"]`.
    pub fn with_data_path(self, path: impl Into<String>) -> Self {
        let path = path.into();
        let segments: Vec<String> = path.split('.').map(str::to_string).collect();
        self.with(path, move |instance, _| {
            let mut current = &instance.data;
            for segment in &segments {
                current = current.get(segment.as_str())?;
            }
            Some(current.clone())
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        name == CREATOR_ATTRIBUTE || self.accessors.contains_key(name)
    }

    /// Resolve one attribute; unknown names yield `None`
    pub fn resolve(
        &self,
        name: &str,
        instance: &WorkflowInstance,
        context: &BaseContext,
    ) -> Option<Value> {
        match self.accessors.get(name) {
            Some(accessor) => accessor(instance, context),
            None if name == CREATOR_ATTRIBUTE => Some(Value::String(instance.creator.clone())),
            None => None,
        }
    }

    /// Resolve each named attribute into reviewer identities
    ///
    /// Strings are split on commas, arrays contribute each string or number
    /// element. Unresolved names and unusable values are logged and skipped.
    /// Duplicates are dropped, first occurrence wins.
    pub fn identities(
        &self,
        names: &[String],
        instance: &WorkflowInstance,
        context: &BaseContext,
    ) -> Vec<String> {
        let mut identities: Vec<String> = Vec::new();
        for name in names {
            let Some(value) = self.resolve(name, instance, context) else {
                tracing::warn!(
                    "Attribute '{}' could not be resolved for workflow {} ({})",
                    name,
                    instance.id,
                    instance.workflow_type
                );
                continue;
            };
            let mut resolved = Vec::new();
            collect_identities(&value, &mut resolved);
            if resolved.is_empty() {
                tracing::warn!(
                    "Attribute '{}' of workflow {} holds no reviewer identity: {}",
                    name,
                    instance.id,
                    value
                );
            }
            for identity in resolved {
                if !identities.contains(&identity) {
                    identities.push(identity);
                }
            }
        }
        identities
    }
}

fn collect_identities(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.extend(
            s.split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(str::to_string),
        ),
        Value::Number(n) => out.push(n.to_string()),
        Value::Array(items) => {
            for item in items {
                if matches!(item, Value::String(_) | Value::Number(_)) {
                    collect_identities(item, out);
                }
            }
        }
        _ => {}
    }
}

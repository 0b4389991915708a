/// Error taxonomy for the review workflow engine
///
/// Every fallible operation returns a `FlowError`. Collaborator seams (hooks,
/// audit sink, attachment store) speak `anyhow` and get wrapped here.

use thiserror::Error;

/// Errors surfaced by workflow, task and transition operations
#[derive(Debug, Error)]
pub enum FlowError {
    /// Missing or inconsistent registration (unknown step table, a step with no
    /// reviewer tasks, a step that resolves to zero assignees)
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Unknown workflow type, instance, step or task
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    /// Acting user is not the assignee of a non-public review task
    #[error("user '{user}' has no permission on review task {task_id}")]
    Permission { user: String, task_id: i64 },

    /// Only the creator may start or edit an instance
    #[error("user '{user}' is not the creator of workflow {workflow_id}")]
    NotCreator { user: String, workflow_id: i64 },

    /// Malformed or out-of-place submission, rejected before any mutation
    #[error("invalid request: {0}")]
    Validation(String),

    /// The instance row moved underneath this transition
    #[error("workflow {workflow_id} was modified concurrently")]
    Conflict { workflow_id: i64 },

    /// A transition or step clear hook returned an error
    #[error("transition hook failed: {0}")]
    Hook(#[source] anyhow::Error),

    /// Upload to the attachment store failed
    #[error("attachment handling failed: {0}")]
    Attachment(#[source] anyhow::Error),

    /// Store failure, including constraint violations
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Instance data or submission payload is not valid JSON
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// Coarse classification used by callers to map errors to responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    NotFound,
    Permission,
    Validation,
    /// Store or hook failure inside a transition; the transaction was rolled back
    Transition,
}

impl FlowError {
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FlowError::Configuration(_) => ErrorKind::Configuration,
            FlowError::NotFound { .. } => ErrorKind::NotFound,
            FlowError::Permission { .. } | FlowError::NotCreator { .. } => ErrorKind::Permission,
            FlowError::Validation(_) => ErrorKind::Validation,
            FlowError::Conflict { .. }
            | FlowError::Hook(_)
            | FlowError::Attachment(_)
            | FlowError::Database(_)
            | FlowError::Serialization(_) => ErrorKind::Transition,
        }
    }
}

pub type FlowResult<T> = std::result::Result<T, FlowError>;

/// Table names are interpolated into SQL, so only plain identifiers are accepted
pub(crate) fn validate_identifier(name: &str) -> FlowResult<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(FlowError::Configuration(format!(
            "'{}' is not a valid table name",
            name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers() {
        assert!(validate_identifier("step_handlers").is_ok());
        assert!(validate_identifier("_t1").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("1abc").is_err());
        assert!(validate_identifier("x; DROP TABLE y").is_err());
    }

    #[test]
    fn kinds() {
        assert_eq!(
            FlowError::not_found("step", "B").kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            FlowError::Conflict { workflow_id: 1 }.kind(),
            ErrorKind::Transition
        );
        assert_eq!(
            FlowError::Hook(anyhow::anyhow!("boom")).kind(),
            ErrorKind::Transition
        );
    }
}

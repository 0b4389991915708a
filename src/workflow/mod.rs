/// Workflow Management Layer
///
/// This module handles workflow definitions, persistence and the start-up registry.
/// It provides:
/// - Type definitions (WorkflowInstance, ReviewTask, Submission)
/// - SQLite persistence with sqlx for instances and reviewer tasks
/// - Step definitions with lexicographic step ordering
/// - The read-only workflow type registry

// Core workflow type definitions
pub mod types;

// Attribute accessors used to seed default reviewers
pub mod attributes;

// Step definitions and per-type step ordering
pub mod step;

// Instance lifecycle: step lookups bound to a workflow type
pub mod lifecycle;

// SQLite persistence for workflow instances
pub mod storage;

// SQLite persistence for reviewer tasks
pub mod tasks;

// Start-up registry of workflow types
pub mod registry;

// Re-export commonly used types
pub use attributes::AttributeMap;
pub use lifecycle::{BaseContext, Flow};
pub use registry::{WorkflowType, WorkflowTypeRegistry};
pub use step::{StepDefinition, StepRegistry, TaskKind};
pub use storage::WorkflowStorage;
pub use tasks::ReviewTaskStore;
pub use types::{
    Attachment, Conclusion, FlowStatus, NewReviewTask, NewWorkflowInstance, ReviewTask,
    Submission, TaskId, WorkflowId, WorkflowInstance,
};

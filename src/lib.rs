/// Reviewflow: multi-step human approval workflow engine
///
/// This library drives business objects through ordered review steps. Each
/// step needs a pass rate of reviewer approvals to advance; too many
/// rejections roll the instance back to the previous step or to draft.

// Core configuration and setup
pub mod config;

// Error taxonomy shared by every layer
pub mod error;

// Workflow management layer - instances, steps, reviewer tasks and the type registry
pub mod workflow;

// Runtime layer - transition engine and the review service around it
pub mod runtime;

// Pool, schema and service wiring
pub mod bootstrap;

// Re-export commonly used types for external consumers
pub use error::{ErrorKind, FlowError, FlowResult};
pub use runtime::{ReviewService, SubmitOutcome, TransitionOutcome};
pub use workflow::{
    AttributeMap, BaseContext, Conclusion, FlowStatus, ReviewTask, StepDefinition, StepRegistry,
    Submission, WorkflowInstance, WorkflowType, WorkflowTypeRegistry,
};

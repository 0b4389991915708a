/// Runtime Review Engine
///
/// This module drives workflow instances through their steps.
/// It handles:
/// - Pass-rate evaluation and step transitions
/// - The review service entry points run inside one transaction each
/// - Pre/post transition hooks
/// - Audit records and submission attachments

// Core transition engine deciding hold / advance / rollback
pub mod engine;

// Reviewer-facing entry points wrapping the engine in transactions
pub mod review;

// Optional callbacks around a transition
pub mod hooks;

// Best-effort operation log
pub mod audit;

// Files uploaded with a submission
pub mod attachments;

// Re-export main types
pub use attachments::{AttachmentStore, LocalAttachmentStore, StoredAttachment};
pub use audit::{AuditRecord, AuditSink, SqliteAuditLog, TracingAuditSink};
pub use engine::{Decision, Tally, TransitionEngine, TransitionOutcome};
pub use hooks::{HookContext, StepClearHook, TransitionHook};
pub use review::{ReviewService, SubmitOutcome};

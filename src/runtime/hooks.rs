/// Transition hooks
///
/// A workflow type may register a hook that runs before the transition engine
/// and one that runs after it. A step may register a hook that runs when it is
/// rejected and its reviewer tasks are cleared. All of them run on the
/// submission's transaction, so a hook error rolls back the whole submission.

use crate::workflow::{
    lifecycle::BaseContext,
    types::{ReviewTask, Submission, WorkflowId, WorkflowInstance},
};
use async_trait::async_trait;
use sqlx::SqliteConnection;

/// Everything a hook may inspect or write through
pub struct HookContext<'a> {
    /// Identity of the user who submitted the decision
    pub actor: &'a str,
    /// Open transaction of the submission
    pub conn: &'a mut SqliteConnection,
    pub base_context: &'a BaseContext,
    /// Instance as positioned when the hook runs
    pub instance: &'a WorkflowInstance,
    /// Task the decision was submitted for, carrying the submitted conclusion
    pub task: &'a ReviewTask,
    pub submission: &'a Submission,
    /// Tasks of the step the instance waits on after the transition (empty before it)
    pub current_tasks: &'a [ReviewTask],
}

#[async_trait]
pub trait TransitionHook: Send + Sync {
    /// Returning `Some(remark)` replaces the default audit remark
    async fn run(&self, cx: HookContext<'_>) -> anyhow::Result<Option<String>>;
}

/// Resets business data owned by a step once its reviewer tasks are cleared
#[async_trait]
pub trait StepClearHook: Send + Sync {
    async fn on_clear(
        &self,
        conn: &mut SqliteConnection,
        workflow_type: &str,
        workflow_id: WorkflowId,
    ) -> anyhow::Result<()>;
}

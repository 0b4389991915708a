/// Core workflow type definitions
///
/// Defines workflow instances, reviewer tasks and the submission payload a
/// reviewer sends. Instances and tasks are persisted in SQLite; the business
/// payload of an instance is kept as JSON.

use crate::error::{FlowError, FlowResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type WorkflowId = i64;
pub type TaskId = i64;

/// `current_step` of an instance that has not entered its first step
pub const NOT_STARTED: &str = "";

/// `current_step` of an instance that has passed its last step
pub const FINISHED_STEP: &str = "-";

/// Lifecycle status of a workflow instance
///
/// Persisted as integer codes: Draft=1, Running=2, Finished=3, Rejected=4, TimedOut=5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Draft,
    Running,
    Finished,
    Rejected,
    /// Set only by an external scheduler
    TimedOut,
}

impl FlowStatus {
    pub fn code(self) -> i64 {
        match self {
            FlowStatus::Draft => 1,
            FlowStatus::Running => 2,
            FlowStatus::Finished => 3,
            FlowStatus::Rejected => 4,
            FlowStatus::TimedOut => 5,
        }
    }

    pub fn from_code(code: i64) -> FlowResult<Self> {
        match code {
            1 => Ok(FlowStatus::Draft),
            2 => Ok(FlowStatus::Running),
            3 => Ok(FlowStatus::Finished),
            4 => Ok(FlowStatus::Rejected),
            5 => Ok(FlowStatus::TimedOut),
            other => Err(FlowError::Validation(format!(
                "unknown workflow status code {}",
                other
            ))),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FlowStatus::Finished | FlowStatus::Rejected | FlowStatus::TimedOut
        )
    }
}

/// A reviewer's decision on one task
///
/// Serialized as its integer code so submissions read `{"conclusion": 1}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum Conclusion {
    #[default]
    Pending,
    Approved,
    ApprovedWithRisk,
    Rejected,
    TransferredToOther,
}

impl Conclusion {
    pub fn code(self) -> i64 {
        match self {
            Conclusion::Pending => 0,
            Conclusion::Approved => 1,
            Conclusion::ApprovedWithRisk => 2,
            Conclusion::Rejected => 3,
            Conclusion::TransferredToOther => 100,
        }
    }

    pub fn is_finished(self) -> bool {
        self != Conclusion::Pending
    }

    /// Approved and approved-with-risk both count towards the pass rate
    pub fn is_approval(self) -> bool {
        matches!(self, Conclusion::Approved | Conclusion::ApprovedWithRisk)
    }
}

impl TryFrom<i64> for Conclusion {
    type Error = FlowError;

    fn try_from(code: i64) -> FlowResult<Self> {
        match code {
            0 => Ok(Conclusion::Pending),
            1 => Ok(Conclusion::Approved),
            2 => Ok(Conclusion::ApprovedWithRisk),
            3 => Ok(Conclusion::Rejected),
            100 => Ok(Conclusion::TransferredToOther),
            other => Err(FlowError::Validation(format!(
                "unknown conclusion code {}",
                other
            ))),
        }
    }
}

impl From<Conclusion> for i64 {
    fn from(conclusion: Conclusion) -> Self {
        conclusion.code()
    }
}

/// One in-flight business object moving through approval steps
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInstance {
    /// Assigned by the store on insert
    pub id: WorkflowId,
    /// Registered workflow type name (e.g., "supplier-onboarding")
    pub workflow_type: String,
    /// Step the instance waits on; `NOT_STARTED` before the first step,
    /// `FINISHED_STEP` after the last one
    pub current_step: String,
    pub status: FlowStatus,
    pub creator: String,
    /// Business fields of the owning object, read by attribute accessors
    pub data: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    /// Entered its first step at least once since the last draft
    pub fn is_started(&self) -> bool {
        self.current_step != NOT_STARTED
    }

    /// Passed its last step
    pub fn is_finished(&self) -> bool {
        self.current_step == FINISHED_STEP
    }
}

/// Values needed to insert a new workflow instance
#[derive(Debug, Clone)]
pub struct NewWorkflowInstance {
    pub workflow_type: String,
    pub creator: String,
    pub status: FlowStatus,
    pub data: Value,
}

/// A single reviewer's decision record for one instance at one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewTask {
    pub id: TaskId,
    pub assignee: String,
    pub step_key: String,
    pub workflow_id: WorkflowId,
    pub workflow_type: String,
    pub conclusion: Conclusion,
    pub remark: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReviewTask {
    pub fn is_finished(&self) -> bool {
        self.conclusion.is_finished()
    }

    /// True iff the reviewer approved (with or without risk)
    pub fn is_approved(&self) -> bool {
        self.conclusion.is_approval()
    }
}

/// Values needed to insert a reviewer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReviewTask {
    pub assignee: String,
    pub step_key: String,
    pub workflow_id: WorkflowId,
    pub workflow_type: String,
}

/// Uploaded file accompanying a submission
#[derive(Debug, Clone)]
pub struct Attachment {
    /// Form key the file was attached under
    pub key: String,
    pub filename: String,
    pub content: Vec<u8>,
}

/// A reviewer's decision as submitted by the caller
///
/// JSON shape: `{"conclusion": 1, "remark": "...", "transferTo": "bob", "remainingIds": [4, 5]}`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    #[serde(default)]
    pub conclusion: Conclusion,
    #[serde(default)]
    pub remark: String,
    /// New assignee when `conclusion` is `TransferredToOther`
    #[serde(default)]
    pub transfer_to: Option<String>,
    /// Previous-step task ids to reopen on rollback instead of re-seeding the step
    #[serde(default)]
    pub remaining_ids: Vec<TaskId>,
    #[serde(skip)]
    pub attachments: Vec<Attachment>,
}

impl Submission {
    pub fn approve(remark: impl Into<String>) -> Self {
        Self {
            conclusion: Conclusion::Approved,
            remark: remark.into(),
            ..Default::default()
        }
    }

    pub fn approve_with_risk(remark: impl Into<String>) -> Self {
        Self {
            conclusion: Conclusion::ApprovedWithRisk,
            remark: remark.into(),
            ..Default::default()
        }
    }

    pub fn reject(remark: impl Into<String>) -> Self {
        Self {
            conclusion: Conclusion::Rejected,
            remark: remark.into(),
            ..Default::default()
        }
    }

    pub fn transfer(to: impl Into<String>) -> Self {
        Self {
            conclusion: Conclusion::TransferredToOther,
            transfer_to: Some(to.into()),
            ..Default::default()
        }
    }

    /// Only re-review the given tasks of the previous step when this rejection rolls back
    pub fn with_remaining_ids(mut self, ids: Vec<TaskId>) -> Self {
        self.remaining_ids = ids;
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Parse a JSON request body; malformed payloads are validation errors
    pub fn from_json(body: &[u8]) -> FlowResult<Self> {
        let submission: Submission = serde_json::from_slice(body).map_err(|e| {
            tracing::warn!("Rejecting malformed submission payload: {}", e);
            FlowError::Validation(format!("malformed submission: {}", e))
        })?;
        submission.validate()?;
        Ok(submission)
    }

    pub fn validate(&self) -> FlowResult<()> {
        match self.conclusion {
            Conclusion::Pending => Err(FlowError::Validation(
                "a submission must carry a decisive conclusion".to_string(),
            )),
            Conclusion::TransferredToOther => match self.transfer_to.as_deref().map(str::trim) {
                Some(to) if !to.is_empty() => Ok(()),
                _ => Err(FlowError::Validation(
                    "transfer requires a target user".to_string(),
                )),
            },
            _ => Ok(()),
        }
    }

    pub fn is_transfer(&self) -> bool {
        self.conclusion == Conclusion::TransferredToOther
    }
}

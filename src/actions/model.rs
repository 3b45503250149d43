//! Scheduled action model and status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Everything a rule can ask for. Only the kinds in [`DELAYABLE_KINDS`]
/// may be scheduled for later execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Archive,
    Label,
    Reply,
    SendEmail,
    Forward,
    Draft,
    MarkSpam,
    MarkRead,
    CallWebhook,
    TrackThread,
}

/// Action kinds that may be deferred via a ScheduledAction.
///
/// Everything else executes inline when its rule fires; deferring a
/// webhook or read-state change has no meaningful semantics.
pub const DELAYABLE_KINDS: &[ActionKind] = &[
    ActionKind::Archive,
    ActionKind::Label,
    ActionKind::Reply,
    ActionKind::SendEmail,
    ActionKind::Forward,
    ActionKind::Draft,
    ActionKind::MarkSpam,
];

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Archive => "archive",
            Self::Label => "label",
            Self::Reply => "reply",
            Self::SendEmail => "send_email",
            Self::Forward => "forward",
            Self::Draft => "draft",
            Self::MarkSpam => "mark_spam",
            Self::MarkRead => "mark_read",
            Self::CallWebhook => "call_webhook",
            Self::TrackThread => "track_thread",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "archive" => Self::Archive,
            "label" => Self::Label,
            "reply" => Self::Reply,
            "send_email" => Self::SendEmail,
            "forward" => Self::Forward,
            "draft" => Self::Draft,
            "mark_spam" => Self::MarkSpam,
            "mark_read" => Self::MarkRead,
            "call_webhook" => Self::CallWebhook,
            "track_thread" => Self::TrackThread,
            _ => return None,
        })
    }

    pub fn is_delayable(&self) -> bool {
        DELAYABLE_KINDS.contains(self)
    }
}

/// Status of a scheduled action.
///
/// PENDING → EXECUTING → {COMPLETED, FAILED}; PENDING → CANCELLED.
/// The PENDING→EXECUTING edge is taken through a store-level conditional
/// update — the sole concurrency-safety mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "executing" => Self::Executing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Outcome of the external scheduling call, kept for tracing which queue
/// entry corresponds to this row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingStatus {
    Scheduled,
    Failed,
    Cancelled,
}

impl SchedulingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "scheduled" => Self::Scheduled,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => return None,
        })
    }
}

/// Immutable payload snapshot captured at schedule time, so execution
/// never depends on mutable rule state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionPayload {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    #[serde(default)]
    pub folder: Option<String>,
}

/// A persisted scheduled action. Rows are never deleted.
#[derive(Debug, Clone)]
pub struct ScheduledAction {
    pub id: Uuid,
    pub account_id: String,
    pub rule_execution_id: Option<Uuid>,
    pub message_id: String,
    pub thread_id: String,
    pub kind: ActionKind,
    pub payload: ActionPayload,
    pub status: ActionStatus,
    pub scheduled_for: DateTime<Utc>,
    /// External queue job id, for tracing.
    pub external_job_id: Option<String>,
    pub scheduling_status: Option<SchedulingStatus>,
    pub executed_at: Option<DateTime<Utc>>,
    /// Provider-side result id recorded on completion.
    pub result_id: Option<String>,
    /// Error message recorded on failure.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request to schedule an action.
#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    pub account_id: String,
    pub rule_execution_id: Option<Uuid>,
    pub message_id: String,
    pub thread_id: String,
    pub kind: ActionKind,
    pub payload: ActionPayload,
    pub scheduled_for: DateTime<Utc>,
}

impl ScheduleRequest {
    /// Reject non-delayable kinds and non-positive delays before any
    /// side effect.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), ValidationError> {
        if self.account_id.trim().is_empty() {
            return Err(ValidationError::MissingField("account_id"));
        }
        if self.message_id.trim().is_empty() {
            return Err(ValidationError::MissingField("message_id"));
        }
        if self.thread_id.trim().is_empty() {
            return Err(ValidationError::MissingField("thread_id"));
        }
        if !self.kind.is_delayable() {
            return Err(ValidationError::NotDelayable {
                kind: self.kind.as_str().to_string(),
            });
        }
        if self.scheduled_for <= now {
            return Err(ValidationError::NonPositiveDelay {
                scheduled_for: self.scheduled_for.to_rfc3339(),
            });
        }
        Ok(())
    }
}

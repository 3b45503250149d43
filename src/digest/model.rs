//! Digest models.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Fixed placeholder written over item content once a digest is sent.
/// Post-send, the original summary text must be unrecoverable.
pub const REDACTED_CONTENT: &str = "[REDACTED]";

/// Status of a digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestStatus {
    Pending,
    Processing,
    Sent,
    Failed,
}

impl DigestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "processing" => Self::Processing,
            "sent" => Self::Sent,
            "failed" => Self::Failed,
            _ => return None,
        })
    }
}

/// An aggregated summary email in the making.
///
/// An account has at most one PENDING digest receiving new items.
#[derive(Debug, Clone)]
pub struct Digest {
    pub id: Uuid,
    pub account_id: String,
    pub status: DigestStatus,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

/// One summarized message inside a digest.
#[derive(Debug, Clone)]
pub struct DigestItem {
    pub id: Uuid,
    pub digest_id: Uuid,
    pub message_id: String,
    pub thread_id: String,
    /// Human-readable name of the rule that routed this message here.
    pub rule_name: String,
    /// Serialized summary JSON; replaced by [`REDACTED_CONTENT`] on send.
    pub content: String,
    pub rule_execution_id: Option<Uuid>,
    pub cold_email_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-account digest delivery schedule.
#[derive(Debug, Clone)]
pub struct DigestSchedule {
    pub account_id: String,
    /// Six-field cron expression (seconds first).
    pub cron_expression: String,
    pub last_occurrence: Option<DateTime<Utc>>,
    pub next_occurrence: Option<DateTime<Utc>>,
}

/// Next fire time of a cron expression strictly after `after`.
pub fn next_occurrence(
    expression: &str,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ValidationError> {
    let schedule =
        cron::Schedule::from_str(expression).map_err(|e| ValidationError::InvalidValue {
            field: "cron_expression",
            message: e.to_string(),
        })?;
    Ok(schedule.after(&after).next())
}

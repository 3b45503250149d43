//! Bulk processing job model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a bulk mailbox scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkJobStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl BulkJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "cancelled" => Self::Cancelled,
            "failed" => Self::Failed,
            _ => return None,
        })
    }
}

/// A persisted bulk job with progress counters.
///
/// The pagination cursor is deliberately absent: it lives only in the
/// fetch-page payload, threaded opaque between invocations.
#[derive(Debug, Clone)]
pub struct BulkJob {
    pub id: Uuid,
    pub account_id: String,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub only_unread: bool,
    pub force_reprocess: bool,
    pub status: BulkJobStatus,
    pub pages_fetched: u32,
    pub total_discovered: u64,
    pub total_queued: u64,
    pub processed_count: u64,
    pub failed_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A record that a rule ran against a message. Presence short-circuits
/// reprocessing of the same (account, message) pair.
#[derive(Debug, Clone)]
pub struct RuleExecution {
    pub id: Uuid,
    pub account_id: String,
    pub message_id: String,
    pub thread_id: String,
    pub rule_name: String,
    pub executed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for status in [
            BulkJobStatus::Running,
            BulkJobStatus::Completed,
            BulkJobStatus::Cancelled,
            BulkJobStatus::Failed,
        ] {
            assert_eq!(BulkJobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(BulkJobStatus::parse("paused"), None);
    }
}

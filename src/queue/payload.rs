//! Typed job payloads — one variant per job name.
//!
//! Payloads are the versionable wire contract between enqueuers and
//! handlers. Every payload is validated at the queue boundary before any
//! handler logic runs; a missing or empty required string fails fast with
//! no side effects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// A message snapshot carried by a digest-add-item job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestMessage {
    pub id: String,
    pub thread_id: String,
    pub from: String,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    pub content: String,
}

/// Job payload, discriminated by job name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum JobPayload {
    /// Execute one scheduled action at (or after) its due time.
    ExecuteAction {
        scheduled_action_id: Uuid,
        scheduled_for: DateTime<Utc>,
    },
    /// Fetch one page of a bulk mailbox scan and fan out worker jobs.
    BulkFetchPage {
        job_id: Uuid,
        account_id: String,
        start_date: DateTime<Utc>,
        #[serde(default)]
        end_date: Option<DateTime<Utc>>,
        #[serde(default)]
        only_unread: bool,
        #[serde(default)]
        force_reprocess: bool,
        #[serde(default)]
        page_token: Option<String>,
        #[serde(default)]
        page_count: u32,
    },
    /// Process one message discovered by a bulk fetch.
    ProcessMessage {
        job_id: Uuid,
        account_id: String,
        message_id: String,
        thread_id: String,
        #[serde(default)]
        force_reprocess: bool,
    },
    /// Append one summarized message to the account's pending digest.
    DigestAddItem {
        account_id: String,
        #[serde(default)]
        action_id: Option<Uuid>,
        #[serde(default)]
        cold_email_id: Option<String>,
        message: DigestMessage,
    },
    /// Render and send the account's pending digests.
    DigestSend {
        account_id: String,
        #[serde(default)]
        force: bool,
    },
    /// Recovery sweep over actions stuck past their due time.
    SweepStuckActions {},
}

impl JobPayload {
    /// Job name, as used in logs and idempotency keys.
    pub fn job_name(&self) -> &'static str {
        match self {
            Self::ExecuteAction { .. } => "execute_action",
            Self::BulkFetchPage { .. } => "bulk_fetch_page",
            Self::ProcessMessage { .. } => "process_message",
            Self::DigestAddItem { .. } => "digest_add_item",
            Self::DigestSend { .. } => "digest_send",
            Self::SweepStuckActions {} => "sweep_stuck_actions",
        }
    }

    /// Validate required fields. Called by the queue before accepting the
    /// job and by the router before dispatching it.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::ExecuteAction {
                scheduled_action_id,
                ..
            } => {
                if scheduled_action_id.is_nil() {
                    return Err(ValidationError::MissingField("scheduled_action_id"));
                }
            }
            Self::BulkFetchPage {
                job_id,
                account_id,
                start_date,
                end_date,
                page_token,
                ..
            } => {
                if job_id.is_nil() {
                    return Err(ValidationError::MissingField("job_id"));
                }
                require("account_id", account_id)?;
                if let Some(end) = end_date {
                    if end <= start_date {
                        return Err(ValidationError::InvalidValue {
                            field: "end_date",
                            message: "must be after start_date".into(),
                        });
                    }
                }
                if let Some(token) = page_token {
                    require("page_token", token)?;
                }
            }
            Self::ProcessMessage {
                job_id,
                account_id,
                message_id,
                thread_id,
                ..
            } => {
                if job_id.is_nil() {
                    return Err(ValidationError::MissingField("job_id"));
                }
                require("account_id", account_id)?;
                require("message_id", message_id)?;
                require("thread_id", thread_id)?;
            }
            Self::DigestAddItem {
                account_id,
                message,
                ..
            } => {
                require("account_id", account_id)?;
                require("message.id", &message.id)?;
                require("message.thread_id", &message.thread_id)?;
                require("message.from", &message.from)?;
            }
            Self::DigestSend { account_id, .. } => {
                require("account_id", account_id)?;
            }
            Self::SweepStuckActions {} => {}
        }
        Ok(())
    }
}

fn require(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField(field));
    }
    Ok(())
}

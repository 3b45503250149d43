//! Digest aggregator — accumulates per-message summaries.
//!
//! Repeated enqueues for the same message are idempotent: the account's
//! pending digest is found-or-created, and the item keyed on
//! (message, thread) is updated rather than duplicated.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result, StoreError};
use crate::queue::DigestMessage;
use crate::store::{Database, DigestItemUpsert};
use crate::summarizer::Summarizer;

/// Rule name attributed to cold-email items, which have no rule
/// execution behind them.
const COLD_EMAIL_RULE: &str = "Cold emails";

/// One add-item invocation, destructured from its payload.
#[derive(Debug, Clone)]
pub struct AddItemJob {
    pub account_id: String,
    /// Rule execution that routed this message into the digest.
    pub action_id: Option<Uuid>,
    pub cold_email_id: Option<String>,
    pub message: DigestMessage,
}

/// Result of one add-item invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddItemOutcome {
    /// The item was written into the account's pending digest.
    Added { digest_id: Uuid, created: bool },
    /// Nothing was written; the reason says why.
    Skipped { reason: &'static str },
}

/// Builds pending digests out of summarized messages.
pub struct DigestAggregator {
    store: Arc<dyn Database>,
    summarizer: Arc<dyn Summarizer>,
    /// The system's own outgoing address; mail from it never digests.
    outgoing_address: String,
}

impl DigestAggregator {
    pub fn new(
        store: Arc<dyn Database>,
        summarizer: Arc<dyn Summarizer>,
        outgoing_address: String,
    ) -> Self {
        Self {
            store,
            summarizer,
            outgoing_address,
        }
    }

    pub async fn add_item(&self, job: &AddItemJob) -> Result<AddItemOutcome> {
        let account = self
            .store
            .get_account(&job.account_id)
            .await?
            .ok_or_else(|| {
                Error::Store(StoreError::NotFound {
                    entity: "account",
                    id: job.account_id.clone(),
                })
            })?;

        // Self-loop guard: our own outgoing mail must never feed back
        // into a digest.
        let sender = job.message.from.to_lowercase();
        if sender == self.outgoing_address.to_lowercase()
            || account
                .assistant_email
                .as_deref()
                .is_some_and(|a| a.to_lowercase() == sender)
        {
            debug!(sender = %job.message.from, "Skipping self-loop sender");
            return Ok(AddItemOutcome::Skipped {
                reason: "self-loop sender",
            });
        }

        // An item nobody can attribute to a rule has no place in the
        // digest — there is no section to file it under.
        let rule_name = match self.resolve_rule_name(job).await? {
            Some(name) => name,
            None => {
                debug!(
                    account_id = %job.account_id,
                    message_id = %job.message.id,
                    "Skipping unattributable digest item"
                );
                return Ok(AddItemOutcome::Skipped {
                    reason: "unattributable",
                });
            }
        };

        let Some(summary) = self.summarizer.summarize(&job.message).await? else {
            return Ok(AddItemOutcome::Skipped {
                reason: "not worth surfacing",
            });
        };
        let content = serde_json::to_string(&summary)
            .map_err(|e| Error::Store(StoreError::Serialization(e.to_string())))?;

        let digest = self
            .store
            .find_or_create_pending_digest(&job.account_id)
            .await?;
        let created = self
            .store
            .upsert_digest_item(DigestItemUpsert {
                digest_id: digest.id,
                message_id: &job.message.id,
                thread_id: &job.message.thread_id,
                rule_name: &rule_name,
                content: &content,
                rule_execution_id: job.action_id,
                cold_email_id: job.cold_email_id.as_deref(),
            })
            .await?;

        debug!(
            digest_id = %digest.id,
            message_id = %job.message.id,
            created,
            "Digest item written"
        );
        Ok(AddItemOutcome::Added {
            digest_id: digest.id,
            created,
        })
    }

    async fn resolve_rule_name(&self, job: &AddItemJob) -> Result<Option<String>> {
        if let Some(action_id) = job.action_id {
            return Ok(self
                .store
                .get_rule_execution(action_id)
                .await?
                .map(|e| e.rule_name));
        }
        if job.cold_email_id.is_some() {
            return Ok(Some(COLD_EMAIL_RULE.to_string()));
        }
        Ok(None)
    }
}

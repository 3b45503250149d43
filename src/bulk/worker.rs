//! Bulk worker — processes one discovered message.
//!
//! Idempotency comes from rule-execution records: the same (account,
//! message) pair is applied once unless the run forces reprocessing. The
//! worker returns a structured outcome; translating a failure outcome
//! into a thrown error is the job router's responsibility — returning
//! `success: false` alone does not trigger a queue retry.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::actions::model::ScheduleRequest;
use crate::actions::scheduler::ActionScheduler;
use crate::bulk::model::{BulkJobStatus, RuleExecution};
use crate::error::{Error, ProviderError, Result, StoreError};
use crate::provider::{EmailDraft, EmailProvider, MailMessage, ProviderFactory};
use crate::queue::{DigestMessage, DurableQueue, EnqueueOptions, JobPayload};
use crate::rules::{PlannedAction, RuleEngine};
use crate::store::Database;

/// Structured result of one worker invocation.
#[derive(Debug, Clone, Default)]
pub struct WorkOutcome {
    pub success: bool,
    pub skipped: bool,
    pub reason: Option<String>,
    pub error: Option<String>,
}

impl WorkOutcome {
    pub fn applied(rule_name: &str) -> Self {
        Self {
            success: true,
            skipped: false,
            reason: Some(format!("applied rule '{rule_name}'")),
            error: None,
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            success: true,
            skipped: true,
            reason: Some(reason.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            skipped: false,
            reason: None,
            error: Some(error.into()),
        }
    }
}

/// One process-message invocation, destructured from its payload.
#[derive(Debug, Clone)]
pub struct ProcessJob {
    pub job_id: Uuid,
    pub account_id: String,
    pub message_id: String,
    pub thread_id: String,
    pub force_reprocess: bool,
}

/// Applies rules to one message at a time.
pub struct BulkWorker {
    store: Arc<dyn Database>,
    providers: Arc<dyn ProviderFactory>,
    rules: Arc<dyn RuleEngine>,
    scheduler: Arc<ActionScheduler>,
    queue: Arc<dyn DurableQueue>,
}

impl BulkWorker {
    pub fn new(
        store: Arc<dyn Database>,
        providers: Arc<dyn ProviderFactory>,
        rules: Arc<dyn RuleEngine>,
        scheduler: Arc<ActionScheduler>,
        queue: Arc<dyn DurableQueue>,
    ) -> Self {
        Self {
            store,
            providers,
            rules,
            scheduler,
            queue,
        }
    }

    /// Process one message. Infrastructure failures come back as `Err`;
    /// rule-level failures as a `WorkOutcome` with `success: false`.
    pub async fn process(&self, job: &ProcessJob) -> Result<WorkOutcome> {
        // Cooperative cancellation check at the step boundary.
        if let Some(bulk_job) = self.store.get_bulk_job(job.job_id).await? {
            if bulk_job.status == BulkJobStatus::Cancelled {
                return Ok(WorkOutcome::skipped("job cancelled"));
            }
        }

        // Idempotency: a recorded rule execution means this message was
        // already handled.
        if !job.force_reprocess
            && self
                .store
                .has_rule_execution(&job.account_id, &job.message_id)
                .await?
        {
            debug!(
                account_id = %job.account_id,
                message_id = %job.message_id,
                "Skipping already-processed message"
            );
            self.record_outcome(job, true).await;
            return Ok(WorkOutcome::skipped("already processed"));
        }

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
        let provider = self.providers.resolve(&job.account_id).await?;

        let fetched = provider
            .get_messages_batch(std::slice::from_ref(&job.message_id))
            .await?;
        let Some(message) = fetched.into_iter().next() else {
            // The message vanished between discovery and processing.
            self.record_outcome(job, true).await;
            return Ok(WorkOutcome::skipped("message gone"));
        };

        let Some(plan) = self.rules.plan(&account, &message).await? else {
            self.record_outcome(job, true).await;
            return Ok(WorkOutcome::skipped("no matching rule"));
        };

        // The execution record id links scheduled actions and digest
        // items back to this run.
        let execution = RuleExecution {
            id: Uuid::new_v4(),
            account_id: job.account_id.clone(),
            message_id: job.message_id.clone(),
            thread_id: job.thread_id.clone(),
            rule_name: plan.rule_name.clone(),
            executed_at: Utc::now(),
        };

        for action in &plan.actions {
            if let Err(e) = self
                .apply_action(&job.account_id, provider.as_ref(), &message, execution.id, action)
                .await
            {
                warn!(
                    message_id = %job.message_id,
                    rule = %plan.rule_name,
                    "Action application failed: {e}"
                );
                self.record_outcome(job, false).await;
                return Ok(WorkOutcome::failed(e.to_string()));
            }
        }

        // Recorded after successful application (a crash mid-way lets the
        // queue's at-least-once redelivery finish the work) but before
        // the digest enqueue — the aggregator resolves the rule name
        // through this row and may run immediately.
        self.store.insert_rule_execution(&execution).await?;

        if plan.digest {
            self.enqueue_digest_item(job, &message, execution.id).await?;
        }
        self.record_outcome(job, true).await;

        info!(
            account_id = %job.account_id,
            message_id = %job.message_id,
            rule = %plan.rule_name,
            "Processed message"
        );
        Ok(WorkOutcome::applied(&plan.rule_name))
    }

    async fn apply_action(
        &self,
        account_id: &str,
        provider: &dyn EmailProvider,
        message: &MailMessage,
        rule_execution_id: Uuid,
        action: &PlannedAction,
    ) -> Result<()> {
        // Delayed actions go through the durable scheduler.
        if let Some(delay) = action.delay {
            self.scheduler
                .schedule(ScheduleRequest {
                    account_id: account_id.to_string(),
                    rule_execution_id: Some(rule_execution_id),
                    message_id: message.id.clone(),
                    thread_id: message.thread_id.clone(),
                    kind: action.kind,
                    payload: action.payload.clone(),
                    scheduled_for: Utc::now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(60)),
                })
                .await?;
            return Ok(());
        }

        use crate::actions::model::ActionKind;
        let payload = &action.payload;
        match action.kind {
            ActionKind::Archive => provider.archive_message(&message.id).await?,
            ActionKind::MarkSpam => provider.mark_spam(&message.id).await?,
            ActionKind::MarkRead => provider.mark_read(&message.id).await?,
            ActionKind::Label => {
                let label = payload.label.as_deref().unwrap_or("Processed");
                provider.add_label(&message.id, label).await?;
            }
            ActionKind::Reply | ActionKind::SendEmail | ActionKind::Forward => {
                let draft = EmailDraft {
                    to: if payload.to.is_empty() {
                        vec![message.from.clone()]
                    } else {
                        payload.to.clone()
                    },
                    cc: payload.cc.clone(),
                    bcc: payload.bcc.clone(),
                    subject: payload
                        .subject
                        .clone()
                        .or_else(|| message.subject.clone())
                        .unwrap_or_default(),
                    html_body: payload.content.clone().unwrap_or_default(),
                    in_reply_to: (action.kind == ActionKind::Reply)
                        .then(|| message.id.clone()),
                };
                provider.send_email(&draft).await?;
            }
            ActionKind::Draft => {
                let draft = EmailDraft {
                    to: payload.to.clone(),
                    cc: payload.cc.clone(),
                    bcc: payload.bcc.clone(),
                    subject: payload.subject.clone().unwrap_or_default(),
                    html_body: payload.content.clone().unwrap_or_default(),
                    in_reply_to: Some(message.id.clone()),
                };
                provider.create_draft(&draft).await?;
            }
            ActionKind::CallWebhook | ActionKind::TrackThread => {
                return Err(Error::Provider(ProviderError::Unsupported {
                    op: "inline rule action",
                }));
            }
        }
        Ok(())
    }

    async fn enqueue_digest_item(
        &self,
        job: &ProcessJob,
        message: &MailMessage,
        rule_execution_id: Uuid,
    ) -> Result<()> {
        let payload = JobPayload::DigestAddItem {
            account_id: job.account_id.clone(),
            action_id: Some(rule_execution_id),
            cold_email_id: None,
            message: DigestMessage {
                id: message.id.clone(),
                thread_id: message.thread_id.clone(),
                from: message.from.clone(),
                to: message.to.first().cloned(),
                subject: message.subject.clone(),
                content: message.content.clone(),
            },
        };
        self.queue
            .enqueue(payload, EnqueueOptions::default())
            .await?;
        Ok(())
    }

    async fn record_outcome(&self, job: &ProcessJob, success: bool) {
        if let Err(e) = self.store.record_bulk_outcome(job.job_id, success).await {
            warn!(job_id = %job.job_id, "Failed to record bulk outcome: {e}");
        }
    }
}

//! Action executor — the PENDING → EXECUTING → terminal state machine.
//!
//! Each invocation is one queue delivery. The conditional status update
//! is the sole concurrency-safety mechanism: no lock, no lease, just
//! `UPDATE … WHERE status = 'pending'` and an affected-row check.
//! Duplicate deliveries and concurrent triggers all collapse into skips.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::actions::model::{ActionKind, ActionStatus, ScheduledAction};
use crate::error::ProviderError;
use crate::provider::{EmailDraft, EmailProvider, ProviderFactory};
use crate::queue::JobError;
use crate::store::Database;

/// Result of one executor invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Not yet due — the queue should re-deliver at this instant.
    NotDue { until: DateTime<Utc> },
    /// This invocation performed the side effect.
    Executed { result_id: Option<String> },
    /// Idempotent no-op: cancelled row, duplicate delivery, or lost race.
    Skipped { reason: &'static str },
}

enum PerformError {
    Provider(ProviderError),
    BadPayload(&'static str),
}

impl From<ProviderError> for PerformError {
    fn from(e: ProviderError) -> Self {
        Self::Provider(e)
    }
}

/// Executes scheduled actions against the account's provider.
pub struct ActionExecutor {
    store: Arc<dyn Database>,
    providers: Arc<dyn ProviderFactory>,
}

impl ActionExecutor {
    pub fn new(store: Arc<dyn Database>, providers: Arc<dyn ProviderFactory>) -> Self {
        Self { store, providers }
    }

    /// Run one delivery for the action.
    ///
    /// Failure contract:
    /// - account/provider resolution failures are retryable and leave the
    ///   row EXECUTING (operator-visible once retries run out);
    /// - transient provider failures with attempts remaining revert the
    ///   row to PENDING so the retry's conditional update can win again;
    /// - the final attempt records FAILED with the error message.
    pub async fn execute(
        &self,
        action_id: Uuid,
        final_attempt: bool,
    ) -> Result<ExecutionOutcome, JobError> {
        let action = self
            .store
            .get_scheduled_action(action_id)
            .await
            .map_err(JobError::retryable)?
            .ok_or_else(|| JobError::retryable(format!("scheduled action {action_id} not found")))?;

        // Durable sleep: early delivery re-queues itself at the due time.
        let now = Utc::now();
        if action.scheduled_for > now {
            return Ok(ExecutionOutcome::NotDue {
                until: action.scheduled_for,
            });
        }

        if action.status == ActionStatus::Cancelled {
            return Ok(ExecutionOutcome::Skipped {
                reason: "cancelled",
            });
        }
        if action.status != ActionStatus::Pending {
            return Ok(ExecutionOutcome::Skipped {
                reason: "not pending",
            });
        }

        // The one and only claim. Zero affected rows means another
        // delivery won; that is success, not an error.
        let claimed = self
            .store
            .try_transition_action(action_id, ActionStatus::Pending, ActionStatus::Executing)
            .await
            .map_err(JobError::retryable)?;
        if !claimed {
            return Ok(ExecutionOutcome::Skipped {
                reason: "not pending",
            });
        }

        // Resolve a fresh provider. Failures here leave the row
        // EXECUTING: retried up to the policy limit, then operator-visible.
        let account = self
            .store
            .get_account(&action.account_id)
            .await
            .map_err(JobError::retryable)?
            .ok_or_else(|| {
                JobError::retryable(format!("account {} not found", action.account_id))
            })?;
        let provider = self
            .providers
            .resolve(&account.id)
            .await
            .map_err(JobError::retryable)?;

        match self.perform(provider.as_ref(), &action).await {
            Ok(result_id) => {
                self.store
                    .finish_action(
                        action_id,
                        ActionStatus::Completed,
                        result_id.as_deref(),
                        None,
                    )
                    .await
                    .map_err(JobError::retryable)?;
                info!(
                    action_id = %action_id,
                    kind = action.kind.as_str(),
                    "Executed scheduled action"
                );
                Ok(ExecutionOutcome::Executed { result_id })
            }
            Err(PerformError::Provider(ProviderError::MessageGone { .. })) => {
                // The target vanished between scheduling and execution.
                // Nothing left to do — that is completion, not failure.
                self.store
                    .finish_action(
                        action_id,
                        ActionStatus::Completed,
                        Some("target gone"),
                        None,
                    )
                    .await
                    .map_err(JobError::retryable)?;
                Ok(ExecutionOutcome::Executed {
                    result_id: Some("target gone".into()),
                })
            }
            Err(PerformError::Provider(e)) if e.is_retryable() && !final_attempt => {
                // Give the retry a chance to claim again.
                let reverted = self
                    .store
                    .try_transition_action(
                        action_id,
                        ActionStatus::Executing,
                        ActionStatus::Pending,
                    )
                    .await
                    .map_err(JobError::retryable)?;
                if !reverted {
                    warn!(action_id = %action_id, "Could not revert action to pending for retry");
                }
                Err(JobError::retryable(e))
            }
            Err(PerformError::Provider(e)) => {
                self.store
                    .finish_action(
                        action_id,
                        ActionStatus::Failed,
                        None,
                        Some(&e.to_string()),
                    )
                    .await
                    .map_err(JobError::retryable)?;
                Err(JobError::fatal(e))
            }
            Err(PerformError::BadPayload(reason)) => {
                self.store
                    .finish_action(action_id, ActionStatus::Failed, None, Some(reason))
                    .await
                    .map_err(JobError::retryable)?;
                Err(JobError::fatal(reason))
            }
        }
    }

    async fn perform(
        &self,
        provider: &dyn EmailProvider,
        action: &ScheduledAction,
    ) -> Result<Option<String>, PerformError> {
        let payload = &action.payload;
        match action.kind {
            ActionKind::Archive => {
                provider.archive_message(&action.message_id).await?;
                Ok(None)
            }
            ActionKind::Label => {
                let label = payload
                    .label
                    .as_deref()
                    .ok_or(PerformError::BadPayload("label payload missing"))?;
                provider.add_label(&action.message_id, label).await?;
                Ok(None)
            }
            ActionKind::MarkSpam => {
                provider.mark_spam(&action.message_id).await?;
                Ok(None)
            }
            ActionKind::Reply => {
                let content = payload
                    .content
                    .as_deref()
                    .ok_or(PerformError::BadPayload("reply content missing"))?;
                if payload.to.is_empty() {
                    return Err(PerformError::BadPayload("reply recipients missing"));
                }
                let draft = EmailDraft {
                    to: payload.to.clone(),
                    cc: payload.cc.clone(),
                    bcc: payload.bcc.clone(),
                    subject: payload
                        .subject
                        .clone()
                        .unwrap_or_else(|| "Re:".to_string()),
                    html_body: content.to_string(),
                    in_reply_to: Some(action.message_id.clone()),
                };
                Ok(Some(provider.send_email(&draft).await?))
            }
            ActionKind::SendEmail | ActionKind::Forward => {
                let content = payload
                    .content
                    .as_deref()
                    .ok_or(PerformError::BadPayload("email content missing"))?;
                if payload.to.is_empty() {
                    return Err(PerformError::BadPayload("email recipients missing"));
                }
                let draft = EmailDraft {
                    to: payload.to.clone(),
                    cc: payload.cc.clone(),
                    bcc: payload.bcc.clone(),
                    subject: payload.subject.clone().unwrap_or_default(),
                    html_body: content.to_string(),
                    in_reply_to: None,
                };
                Ok(Some(provider.send_email(&draft).await?))
            }
            ActionKind::Draft => {
                let content = payload.content.as_deref().unwrap_or_default();
                let draft = EmailDraft {
                    to: payload.to.clone(),
                    cc: payload.cc.clone(),
                    bcc: payload.bcc.clone(),
                    subject: payload.subject.clone().unwrap_or_default(),
                    html_body: content.to_string(),
                    in_reply_to: Some(action.message_id.clone()),
                };
                Ok(Some(provider.create_draft(&draft).await?))
            }
            ActionKind::MarkRead | ActionKind::CallWebhook | ActionKind::TrackThread => {
                // Scheduling validation rejects these; a row carrying one
                // is corrupt.
                Err(PerformError::BadPayload("action kind is not delayable"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::Ordering;

    use crate::actions::model::{ActionPayload, ScheduleRequest};
    use crate::actions::scheduler::ActionScheduler;
    use crate::provider::testing::{FakeFactory, FakeProvider};
    use crate::queue::testing::RecordingQueue;
    use crate::store::{Account, Database as _, LibSqlBackend};

    struct Fixture {
        executor: ActionExecutor,
        scheduler: ActionScheduler,
        store: Arc<LibSqlBackend>,
        provider: Arc<FakeProvider>,
        factory: Arc<FakeFactory>,
    }

    async fn setup() -> Fixture {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        store
            .insert_account(&Account {
                id: "acct-1".into(),
                email: "user@example.com".into(),
                assistant_email: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let provider = Arc::new(FakeProvider::default());
        let factory = Arc::new(FakeFactory::new(provider.clone()));
        let queue = Arc::new(RecordingQueue::default());
        Fixture {
            executor: ActionExecutor::new(store.clone(), factory.clone()),
            scheduler: ActionScheduler::new(store.clone(), queue),
            store,
            provider,
            factory,
        }
    }

    async fn due_action(fx: &Fixture, kind: ActionKind, payload: ActionPayload) -> Uuid {
        // Schedule slightly in the future, then age the row so the
        // executor sees it as due.
        let action = fx
            .scheduler
            .schedule(ScheduleRequest {
                account_id: "acct-1".into(),
                rule_execution_id: None,
                message_id: "m1".into(),
                thread_id: "t1".into(),
                kind,
                payload,
                scheduled_for: Utc::now() + ChronoDuration::milliseconds(5),
            })
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        action.id
    }

    #[tokio::test]
    async fn executes_due_archive_action() {
        let fx = setup().await;
        let id = due_action(&fx, ActionKind::Archive, ActionPayload::default()).await;

        let outcome = fx.executor.execute(id, false).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Executed { result_id: None });
        assert_eq!(fx.provider.archived.lock().unwrap().as_slice(), ["m1"]);

        let stored = fx.store.get_scheduled_action(id).await.unwrap().unwrap();
        assert_eq!(stored.status, ActionStatus::Completed);
        assert!(stored.executed_at.is_some());
    }

    #[tokio::test]
    async fn not_due_defers_without_side_effect() {
        let fx = setup().await;
        let action = fx
            .scheduler
            .schedule(ScheduleRequest {
                account_id: "acct-1".into(),
                rule_execution_id: None,
                message_id: "m1".into(),
                thread_id: "t1".into(),
                kind: ActionKind::Archive,
                payload: ActionPayload::default(),
                scheduled_for: Utc::now() + ChronoDuration::minutes(30),
            })
            .await
            .unwrap();

        let outcome = fx.executor.execute(action.id, false).await.unwrap();
        match outcome {
            ExecutionOutcome::NotDue { until } => assert_eq!(until, action.scheduled_for),
            other => panic!("expected NotDue, got {other:?}"),
        }
        assert!(fx.provider.archived.lock().unwrap().is_empty());
        // No provider client was even resolved.
        assert_eq!(fx.factory.resolve_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn second_invocation_skips_not_pending() {
        let fx = setup().await;
        let id = due_action(&fx, ActionKind::Archive, ActionPayload::default()).await;

        let first = fx.executor.execute(id, false).await.unwrap();
        assert!(matches!(first, ExecutionOutcome::Executed { .. }));

        let second = fx.executor.execute(id, false).await.unwrap();
        assert_eq!(
            second,
            ExecutionOutcome::Skipped {
                reason: "not pending"
            }
        );
        // Exactly one provider side effect happened.
        assert_eq!(fx.provider.archived.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_action_skips_without_provider_call() {
        let fx = setup().await;
        let id = due_action(&fx, ActionKind::Archive, ActionPayload::default()).await;
        fx.store
            .try_transition_action(id, ActionStatus::Pending, ActionStatus::Cancelled)
            .await
            .unwrap();

        let outcome = fx.executor.execute(id, false).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Skipped { reason: "cancelled" });
        assert_eq!(fx.factory.resolve_calls.load(Ordering::SeqCst), 0);
        assert!(fx.provider.archived.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_executions_produce_one_side_effect() {
        let fx = setup().await;
        let id = due_action(&fx, ActionKind::Archive, ActionPayload::default()).await;

        let executor = Arc::new(ActionExecutor::new(
            fx.store.clone(),
            fx.factory.clone(),
        ));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let executor = Arc::clone(&executor);
            handles.push(tokio::spawn(async move {
                executor.execute(id, false).await.unwrap()
            }));
        }

        let mut executed = 0;
        let mut skipped = 0;
        for handle in handles {
            match handle.await.unwrap() {
                ExecutionOutcome::Executed { .. } => executed += 1,
                ExecutionOutcome::Skipped { .. } => skipped += 1,
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(executed, 1, "exactly one invocation may win");
        assert_eq!(skipped, 7);
        assert_eq!(fx.provider.archived.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn target_gone_completes() {
        let fx = setup().await;
        let id = due_action(&fx, ActionKind::Archive, ActionPayload::default()).await;
        fx.provider.target_gone.store(true, Ordering::SeqCst);

        let outcome = fx.executor.execute(id, false).await.unwrap();
        assert_eq!(
            outcome,
            ExecutionOutcome::Executed {
                result_id: Some("target gone".into())
            }
        );
        let stored = fx.store.get_scheduled_action(id).await.unwrap().unwrap();
        assert_eq!(stored.status, ActionStatus::Completed);
    }

    #[tokio::test]
    async fn transient_failure_reverts_to_pending_for_retry() {
        let fx = setup().await;
        let id = due_action(&fx, ActionKind::Archive, ActionPayload::default()).await;
        fx.provider.fail_sends.store(true, Ordering::SeqCst);

        let err = fx.executor.execute(id, false).await.unwrap_err();
        assert!(err.is_retryable());

        let stored = fx.store.get_scheduled_action(id).await.unwrap().unwrap();
        assert_eq!(stored.status, ActionStatus::Pending, "retry must be able to claim");

        // The retry succeeds once the provider recovers.
        fx.provider.fail_sends.store(false, Ordering::SeqCst);
        let outcome = fx.executor.execute(id, false).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Executed { .. }));
    }

    #[tokio::test]
    async fn final_attempt_failure_is_terminal() {
        let fx = setup().await;
        let id = due_action(&fx, ActionKind::Archive, ActionPayload::default()).await;
        fx.provider.fail_sends.store(true, Ordering::SeqCst);

        let err = fx.executor.execute(id, true).await.unwrap_err();
        assert!(!err.is_retryable());

        let stored = fx.store.get_scheduled_action(id).await.unwrap().unwrap();
        assert_eq!(stored.status, ActionStatus::Failed);
        assert!(stored.error.is_some());
    }

    #[tokio::test]
    async fn missing_account_leaves_row_executing() {
        let fx = setup().await;
        let action_id = {
            // Row for an account the store does not know.
            let now = Utc::now();
            let action = ScheduledAction {
                id: Uuid::new_v4(),
                account_id: "ghost".into(),
                rule_execution_id: None,
                message_id: "m1".into(),
                thread_id: "t1".into(),
                kind: ActionKind::Archive,
                payload: ActionPayload::default(),
                status: ActionStatus::Pending,
                scheduled_for: now - ChronoDuration::seconds(1),
                external_job_id: None,
                scheduling_status: None,
                executed_at: None,
                result_id: None,
                error: None,
                created_at: now,
                updated_at: now,
            };
            fx.store.insert_scheduled_action(&action).await.unwrap();
            action.id
        };

        let err = fx.executor.execute(action_id, false).await.unwrap_err();
        assert!(err.is_retryable());
        let stored = fx.store.get_scheduled_action(action_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ActionStatus::Executing);
    }

    #[tokio::test]
    async fn reply_sends_email_with_snapshot_payload() {
        let fx = setup().await;
        let id = due_action(
            &fx,
            ActionKind::Reply,
            ActionPayload {
                content: Some("<p>On it.</p>".into()),
                subject: Some("Re: question".into()),
                to: vec!["alice@example.com".into()],
                ..Default::default()
            },
        )
        .await;

        let outcome = fx.executor.execute(id, false).await.unwrap();
        match outcome {
            ExecutionOutcome::Executed { result_id } => assert!(result_id.is_some()),
            other => panic!("expected Executed, got {other:?}"),
        }
        let sent = fx.provider.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, vec!["alice@example.com".to_string()]);
        assert_eq!(sent[0].in_reply_to.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn label_without_payload_fails_terminally() {
        let fx = setup().await;
        let id = due_action(&fx, ActionKind::Label, ActionPayload::default()).await;

        let err = fx.executor.execute(id, false).await.unwrap_err();
        assert!(!err.is_retryable());
        let stored = fx.store.get_scheduled_action(id).await.unwrap().unwrap();
        assert_eq!(stored.status, ActionStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("label payload missing"));
    }
}

//! Action scheduler — persist first, enqueue exactly once.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::actions::model::{
    ActionStatus, ScheduleRequest, ScheduledAction, SchedulingStatus,
};
use crate::error::Result;
use crate::queue::{DurableQueue, EnqueueOptions, JobPayload};
use crate::store::Database;

/// Deterministic idempotency key for an action's queue job — duplicate
/// scheduling calls for the same row never create duplicate queue entries.
pub fn idempotency_key(action_id: Uuid) -> String {
    format!("scheduled-action-{action_id}")
}

/// Creates ScheduledAction rows and their queue jobs.
pub struct ActionScheduler {
    store: Arc<dyn Database>,
    queue: Arc<dyn DurableQueue>,
}

impl ActionScheduler {
    pub fn new(store: Arc<dyn Database>, queue: Arc<dyn DurableQueue>) -> Self {
        Self { store, queue }
    }

    /// Schedule an action for later execution.
    ///
    /// The payload snapshot is captured on the row now; execution never
    /// reads rule state. On enqueue failure the row stays PENDING (the
    /// sweeper will recover it), its scheduling status is marked FAILED
    /// for tracing, and the error propagates to the caller.
    pub async fn schedule(&self, request: ScheduleRequest) -> Result<ScheduledAction> {
        let now = Utc::now();
        request.validate(now)?;

        let mut action = ScheduledAction {
            id: Uuid::new_v4(),
            account_id: request.account_id,
            rule_execution_id: request.rule_execution_id,
            message_id: request.message_id,
            thread_id: request.thread_id,
            kind: request.kind,
            payload: request.payload,
            status: ActionStatus::Pending,
            scheduled_for: request.scheduled_for,
            external_job_id: None,
            scheduling_status: None,
            executed_at: None,
            result_id: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_scheduled_action(&action).await?;

        let payload = JobPayload::ExecuteAction {
            scheduled_action_id: action.id,
            scheduled_for: action.scheduled_for,
        };
        let options = EnqueueOptions {
            not_before: Some(action.scheduled_for),
            idempotency_key: Some(idempotency_key(action.id)),
            ..Default::default()
        };

        match self.queue.enqueue(payload, options).await {
            Ok(job_id) => {
                let job_id = job_id.to_string();
                self.store
                    .set_scheduling_status(action.id, SchedulingStatus::Scheduled, Some(&job_id))
                    .await?;
                action.scheduling_status = Some(SchedulingStatus::Scheduled);
                action.external_job_id = Some(job_id);
                info!(
                    action_id = %action.id,
                    kind = action.kind.as_str(),
                    scheduled_for = %action.scheduled_for,
                    "Scheduled action"
                );
                Ok(action)
            }
            Err(e) => {
                // Row stays PENDING — recoverable by the sweeper.
                if let Err(mark_err) = self
                    .store
                    .set_scheduling_status(action.id, SchedulingStatus::Failed, None)
                    .await
                {
                    warn!(
                        action_id = %action.id,
                        "Failed to record scheduling failure: {mark_err}"
                    );
                }
                Err(e.into())
            }
        }
    }

    /// Cancel a PENDING action. Returns false once execution has begun
    /// or finished — cancellation then has no effect.
    pub async fn cancel(&self, action_id: Uuid) -> Result<bool> {
        let cancelled = self
            .store
            .try_transition_action(action_id, ActionStatus::Pending, ActionStatus::Cancelled)
            .await?;
        if !cancelled {
            return Ok(false);
        }

        self.store
            .set_scheduling_status(action_id, SchedulingStatus::Cancelled, None)
            .await?;

        // Best effort: drop the queue entry too. The executor skips
        // cancelled rows either way.
        if let Some(action) = self.store.get_scheduled_action(action_id).await? {
            if let Some(job_id) = action
                .external_job_id
                .as_deref()
                .and_then(|s| Uuid::parse_str(s).ok())
            {
                if let Err(e) = self.queue.cancel(job_id).await {
                    warn!(action_id = %action_id, "Queue cancel failed: {e}");
                }
            }
        }
        info!(action_id = %action_id, "Cancelled action");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration as ChronoDuration};
    use std::sync::atomic::Ordering;

    use crate::actions::model::{ActionKind, ActionPayload};
    use crate::error::{Error, ValidationError};
    use crate::queue::testing::RecordingQueue;
    use crate::store::LibSqlBackend;

    async fn setup() -> (ActionScheduler, Arc<LibSqlBackend>, Arc<RecordingQueue>) {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = Arc::new(RecordingQueue::default());
        let scheduler = ActionScheduler::new(store.clone(), queue.clone());
        (scheduler, store, queue)
    }

    fn request(kind: ActionKind, minutes_out: i64) -> ScheduleRequest {
        ScheduleRequest {
            account_id: "acct-1".into(),
            rule_execution_id: None,
            message_id: "m1".into(),
            thread_id: "t1".into(),
            kind,
            payload: ActionPayload {
                label: Some("Later".into()),
                ..Default::default()
            },
            scheduled_for: Utc::now() + ChronoDuration::minutes(minutes_out),
        }
    }

    #[tokio::test]
    async fn schedules_pending_row_and_one_job() {
        let (scheduler, store, queue) = setup().await;
        let action = scheduler
            .schedule(request(ActionKind::Archive, 30))
            .await
            .unwrap();

        let stored = store.get_scheduled_action(action.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ActionStatus::Pending);
        assert_eq!(stored.scheduling_status, Some(SchedulingStatus::Scheduled));
        assert!(stored.external_job_id.is_some());

        let enqueued = queue.enqueued.lock().unwrap();
        assert_eq!(enqueued.len(), 1);
        let (payload, options) = &enqueued[0];
        assert_eq!(payload.job_name(), "execute_action");
        assert_eq!(
            options.idempotency_key.as_deref(),
            Some(idempotency_key(action.id).as_str())
        );
        let not_before: DateTime<Utc> = options.not_before.unwrap();
        assert_eq!(not_before, stored.scheduled_for);
    }

    #[tokio::test]
    async fn rejects_non_delayable_kind() {
        let (scheduler, _store, queue) = setup().await;
        let result = scheduler.schedule(request(ActionKind::CallWebhook, 30)).await;
        assert!(matches!(
            result,
            Err(Error::Validation(ValidationError::NotDelayable { .. }))
        ));
        assert!(queue.enqueued.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_non_positive_delay() {
        let (scheduler, _store, queue) = setup().await;
        let result = scheduler.schedule(request(ActionKind::Archive, -5)).await;
        assert!(matches!(
            result,
            Err(Error::Validation(ValidationError::NonPositiveDelay { .. }))
        ));
        assert!(queue.enqueued.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn enqueue_failure_leaves_row_pending_and_reraises() {
        let (scheduler, store, queue) = setup().await;
        queue.fail_enqueue.store(true, Ordering::SeqCst);

        let result = scheduler.schedule(request(ActionKind::Archive, 30)).await;
        assert!(matches!(result, Err(Error::Queue(_))));

        // The row exists, is still PENDING, and carries the failure marker.
        let actions = store
            .list_due_pending_actions(Utc::now() + ChronoDuration::hours(1), 10)
            .await
            .unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].status, ActionStatus::Pending);
        assert_eq!(actions[0].scheduling_status, Some(SchedulingStatus::Failed));
    }

    #[tokio::test]
    async fn cancel_pending_action() {
        let (scheduler, store, queue) = setup().await;
        let action = scheduler
            .schedule(request(ActionKind::Archive, 30))
            .await
            .unwrap();

        assert!(scheduler.cancel(action.id).await.unwrap());
        let stored = store.get_scheduled_action(action.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ActionStatus::Cancelled);
        assert_eq!(stored.scheduling_status, Some(SchedulingStatus::Cancelled));
        assert_eq!(queue.cancelled.lock().unwrap().len(), 1);

        // Second cancel is a no-op.
        assert!(!scheduler.cancel(action.id).await.unwrap());
    }

    #[tokio::test]
    async fn cancel_does_not_touch_executing_action() {
        let (scheduler, store, _queue) = setup().await;
        let action = scheduler
            .schedule(request(ActionKind::Archive, 30))
            .await
            .unwrap();
        store
            .try_transition_action(action.id, ActionStatus::Pending, ActionStatus::Executing)
            .await
            .unwrap();

        assert!(!scheduler.cancel(action.id).await.unwrap());
        let stored = store.get_scheduled_action(action.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ActionStatus::Executing);
    }
}

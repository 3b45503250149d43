//! Recovery sweeper — re-drives actions stuck past their due time.
//!
//! The sweeper is its own queue job: the last step of every sweep
//! re-enqueues the next one with a future `not_before`. No host-level
//! cron is assumed anywhere.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::actions::scheduler::idempotency_key;
use crate::error::{Error, Result};
use crate::queue::{DurableQueue, EnqueueOptions, JobPayload};
use crate::store::Database;

/// Idempotency key shared by every sweep job, so repeated boots collapse
/// into one armed sweeper instead of stacking them.
pub const SWEEPER_KEY: &str = "action-sweeper";

/// Per-sweep result counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepReport {
    pub examined: usize,
    pub requeued: usize,
    pub failed: usize,
}

/// Finds overdue PENDING actions and re-enqueues their executor jobs.
pub struct RecoverySweeper {
    store: Arc<dyn Database>,
    queue: Arc<dyn DurableQueue>,
    interval: Duration,
    batch: usize,
}

impl RecoverySweeper {
    pub fn new(
        store: Arc<dyn Database>,
        queue: Arc<dyn DurableQueue>,
        interval: Duration,
        batch: usize,
    ) -> Self {
        Self {
            store,
            queue,
            interval,
            batch,
        }
    }

    /// Arm the first sweep. Safe to call on every boot: the idempotency
    /// key collapses duplicates while one sweep is already scheduled.
    pub async fn arm(&self) -> Result<()> {
        self.queue
            .enqueue(
                JobPayload::SweepStuckActions {},
                EnqueueOptions {
                    idempotency_key: Some(SWEEPER_KEY.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Run one sweep.
    ///
    /// Re-arms the next sweep before returning — even when the batch
    /// failed — so the cycle never silently stops. A failing re-trigger
    /// for one row never aborts the rest of the batch.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let result = self.run_batch().await;

        if let Err(e) = self.rearm().await {
            // The report is secondary; a dead sweep cycle is the real
            // incident.
            warn!("Failed to re-arm sweeper: {e}");
        }

        result
    }

    async fn run_batch(&self) -> Result<SweepReport> {
        let now = Utc::now();
        let due = self.store.list_due_pending_actions(now, self.batch).await?;

        let mut report = SweepReport {
            examined: due.len(),
            ..Default::default()
        };
        // No delay on the re-triggers: the actions are already overdue.
        // Failures are counted per row, never aborting the batch.
        let results = futures::future::join_all(due.iter().map(|action| {
            let payload = JobPayload::ExecuteAction {
                scheduled_action_id: action.id,
                scheduled_for: action.scheduled_for,
            };
            let options = EnqueueOptions {
                idempotency_key: Some(idempotency_key(action.id)),
                ..Default::default()
            };
            self.queue.enqueue(payload, options)
        }))
        .await;
        for (action, result) in due.iter().zip(results) {
            match result {
                Ok(_) => report.requeued += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(action_id = %action.id, "Sweeper re-trigger failed: {e}");
                }
            }
        }

        if report.examined > 0 {
            info!(
                examined = report.examined,
                requeued = report.requeued,
                failed = report.failed,
                "Sweep completed"
            );
        }
        Ok(report)
    }

    async fn rearm(&self) -> std::result::Result<(), Error> {
        let next = Utc::now()
            + chrono::Duration::from_std(self.interval).unwrap_or(chrono::Duration::seconds(600));
        self.queue
            .enqueue(
                JobPayload::SweepStuckActions {},
                EnqueueOptions {
                    not_before: Some(next),
                    idempotency_key: Some(SWEEPER_KEY.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }
}

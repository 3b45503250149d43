//! In-process queue runtime implementing the durable-queue contract.
//!
//! Jobs are delivered by spawned tasks: delayed until `not_before`,
//! gated by per-key semaphores, retried with the configured backoff plus
//! jitter. Idempotency keys collapse duplicate enqueues while the first
//! job is still awaiting delivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::error::QueueError;
use crate::queue::{
    DurableQueue, EnqueueOptions, JobDelivery, JobError, JobHandler, JobOutcome, JobPayload,
    JobState,
};

struct JobRecord {
    payload: JobPayload,
    state: JobState,
    attempts_made: u32,
    idempotency_key: Option<String>,
    concurrency_key: Option<String>,
    concurrency_limit: usize,
}

struct DeliveryOrder {
    job_id: Uuid,
    due: Option<DateTime<Utc>>,
    attempt: u32,
}

struct Inner {
    retry: RetryPolicy,
    jobs: Mutex<HashMap<Uuid, JobRecord>>,
    idempotency: Mutex<HashMap<String, Uuid>>,
    limiters: Mutex<HashMap<String, Arc<Semaphore>>>,
    orders_tx: mpsc::UnboundedSender<DeliveryOrder>,
    handler_rx: watch::Receiver<Option<Arc<dyn JobHandler>>>,
    handler_tx: watch::Sender<Option<Arc<dyn JobHandler>>>,
    shut_down: AtomicBool,
}

/// In-memory durable queue.
pub struct InMemoryQueue {
    inner: Arc<Inner>,
}

impl InMemoryQueue {
    /// Create the queue and start its dispatcher. Requires a running
    /// tokio runtime.
    pub fn new(retry: RetryPolicy) -> Self {
        let (orders_tx, orders_rx) = mpsc::unbounded_channel();
        let (handler_tx, handler_rx) = watch::channel(None);
        let inner = Arc::new(Inner {
            retry,
            jobs: Mutex::new(HashMap::new()),
            idempotency: Mutex::new(HashMap::new()),
            limiters: Mutex::new(HashMap::new()),
            orders_tx,
            handler_rx,
            handler_tx,
            shut_down: AtomicBool::new(false),
        });

        let dispatcher_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            let mut orders = UnboundedReceiverStream::new(orders_rx);
            while let Some(order) = orders.next().await {
                let inner = Arc::clone(&dispatcher_inner);
                tokio::spawn(async move {
                    deliver(inner, order).await;
                });
            }
        });

        Self { inner }
    }

    /// Register the handler all deliveries go to. Deliveries enqueued
    /// before registration wait for it.
    pub fn set_handler(&self, handler: Arc<dyn JobHandler>) {
        let _ = self.inner.handler_tx.send(Some(handler));
    }

    /// Refuse further enqueues. In-flight deliveries complete.
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
    }

    /// Observable state of a job, if known.
    pub fn job_state(&self, job_id: Uuid) -> Option<JobState> {
        self.inner.jobs.lock().unwrap().get(&job_id).map(|r| r.state)
    }

    /// Delivery attempts made so far for a job.
    pub fn attempts(&self, job_id: Uuid) -> u32 {
        self.inner
            .jobs
            .lock()
            .unwrap()
            .get(&job_id)
            .map(|r| r.attempts_made)
            .unwrap_or(0)
    }

    /// Count of jobs not yet terminal.
    pub fn live_count(&self) -> usize {
        self.inner
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|r| !r.state.is_terminal())
            .count()
    }

    /// Wait until every accepted job reaches a terminal state.
    /// Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.live_count() == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl DurableQueue for InMemoryQueue {
    async fn enqueue(
        &self,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<Uuid, QueueError> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(QueueError::ShutDown);
        }
        payload
            .validate()
            .map_err(|e| QueueError::Enqueue(format!("invalid {} payload: {e}", payload.job_name())))?;

        // Idempotency: while a keyed job is live, duplicates collapse
        // into it.
        if let Some(ref key) = options.idempotency_key {
            let idempotency = self.inner.idempotency.lock().unwrap();
            if let Some(existing) = idempotency.get(key) {
                debug!(key = %key, job_id = %existing, "Enqueue collapsed by idempotency key");
                return Ok(*existing);
            }
        }

        let job_id = Uuid::new_v4();
        let record = JobRecord {
            payload,
            state: JobState::Scheduled,
            attempts_made: 0,
            idempotency_key: options.idempotency_key.clone(),
            concurrency_key: options.concurrency_key,
            concurrency_limit: options.concurrency_limit.unwrap_or(1),
        };
        self.inner.jobs.lock().unwrap().insert(job_id, record);
        if let Some(key) = options.idempotency_key {
            self.inner.idempotency.lock().unwrap().insert(key, job_id);
        }

        self.inner
            .orders_tx
            .send(DeliveryOrder {
                job_id,
                due: options.not_before,
                attempt: 1,
            })
            .map_err(|_| QueueError::ShutDown)?;
        Ok(job_id)
    }

    async fn cancel(&self, job_id: Uuid) -> Result<bool, QueueError> {
        let mut jobs = self.inner.jobs.lock().unwrap();
        match jobs.get_mut(&job_id) {
            Some(record) if record.state == JobState::Scheduled => {
                record.state = JobState::Cancelled;
                if let Some(key) = record.idempotency_key.take() {
                    self.inner.idempotency.lock().unwrap().remove(&key);
                }
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(QueueError::JobNotFound { id: job_id }),
        }
    }
}

async fn deliver(inner: Arc<Inner>, order: DeliveryOrder) {
    if let Some(due) = order.due {
        let wait = (due - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    // Take a concurrency slot before touching the job.
    let limiter = {
        let jobs = inner.jobs.lock().unwrap();
        let Some(record) = jobs.get(&order.job_id) else {
            return;
        };
        record.concurrency_key.as_ref().map(|key| {
            let mut limiters = inner.limiters.lock().unwrap();
            Arc::clone(
                limiters
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(Semaphore::new(record.concurrency_limit))),
            )
        })
    };
    let _permit = match limiter {
        Some(semaphore) => match semaphore.acquire_owned().await {
            Ok(permit) => Some(permit),
            Err(_) => return,
        },
        None => None,
    };

    // Claim the job; a cancel that raced in wins. The idempotency key is
    // released at claim time — it guards undelivered duplicates, and a
    // handler must be able to re-enqueue its own successor under the
    // same key (self-re-arming jobs).
    let payload = {
        let mut jobs = inner.jobs.lock().unwrap();
        let Some(record) = jobs.get_mut(&order.job_id) else {
            return;
        };
        if record.state != JobState::Scheduled {
            return;
        }
        record.state = JobState::Running;
        record.attempts_made = order.attempt;
        release_key(&inner, record);
        record.payload.clone()
    };

    let handler = {
        let mut rx = inner.handler_rx.clone();
        let guard = match rx.wait_for(|h| h.is_some()).await {
            Ok(guard) => guard,
            Err(_) => return,
        };
        guard.as_ref().map(Arc::clone).unwrap()
    };

    let delivery = JobDelivery {
        job_id: order.job_id,
        payload: &payload,
        attempt: order.attempt,
        max_attempts: inner.retry.max_attempts,
    };
    let result = handler.handle(delivery).await;

    let mut jobs = inner.jobs.lock().unwrap();
    let Some(record) = jobs.get_mut(&order.job_id) else {
        return;
    };
    match result {
        Ok(JobOutcome::Completed) => {
            record.state = JobState::Completed;
        }
        Ok(JobOutcome::Deferred { until }) => {
            // Durable sleep: back to scheduled, same attempt count.
            record.state = JobState::Scheduled;
            let _ = inner.orders_tx.send(DeliveryOrder {
                job_id: order.job_id,
                due: Some(until),
                attempt: order.attempt,
            });
        }
        Err(JobError::Retryable(message)) => {
            if let Some(backoff) = inner.retry.backoff(order.attempt) {
                let delay = backoff + jitter(backoff);
                debug!(
                    job = payload.job_name(),
                    job_id = %order.job_id,
                    attempt = order.attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Job failed, retrying: {message}"
                );
                record.state = JobState::Scheduled;
                let _ = inner.orders_tx.send(DeliveryOrder {
                    job_id: order.job_id,
                    due: Some(
                        Utc::now()
                            + chrono::Duration::from_std(delay)
                                .unwrap_or_else(|_| chrono::Duration::zero()),
                    ),
                    attempt: order.attempt + 1,
                });
            } else {
                warn!(
                    job = payload.job_name(),
                    job_id = %order.job_id,
                    "Job failed after {} attempts: {message}",
                    order.attempt
                );
                record.state = JobState::Failed;
            }
        }
        Err(JobError::Fatal(message)) => {
            warn!(
                job = payload.job_name(),
                job_id = %order.job_id,
                "Job failed permanently: {message}"
            );
            record.state = JobState::Failed;
        }
    }
}

fn release_key(inner: &Inner, record: &mut JobRecord) {
    if let Some(key) = record.idempotency_key.take() {
        inner.idempotency.lock().unwrap().remove(&key);
    }
}

/// Up to 10% extra, capped at 5s, so synchronized retries spread out.
fn jitter(backoff: Duration) -> Duration {
    let cap = (backoff / 10).min(Duration::from_secs(5));
    if cap.is_zero() {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=cap.as_millis() as u64))
}

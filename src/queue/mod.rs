//! Durable queue abstraction.
//!
//! The queue guarantees at-least-once delivery with configurable retry
//! backoff, optional delayed delivery (`not_before`), idempotency keys,
//! and per-key concurrency limiting. Production deployments back this
//! with a hosted queue; `InMemoryQueue` provides the same contract
//! in-process for the local runtime and tests.

pub mod memory;
pub mod payload;

pub use memory::InMemoryQueue;
pub use payload::{DigestMessage, JobPayload};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Error, ProviderError, QueueError};

// ── Enqueue contract ────────────────────────────────────────────────

/// Options for a single enqueue.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Do not deliver before this instant.
    pub not_before: Option<DateTime<Utc>>,
    /// Jobs sharing an idempotency key collapse while one is still
    /// awaiting delivery: a duplicate enqueue returns the existing job
    /// id. The key frees up once delivery starts, so a handler can
    /// re-enqueue its own successor under the same key.
    pub idempotency_key: Option<String>,
    /// Jobs sharing a concurrency key run at most `concurrency_limit`
    /// at a time.
    pub concurrency_key: Option<String>,
    /// Limit for `concurrency_key` (default 1 when a key is set).
    pub concurrency_limit: Option<usize>,
}

/// A durable job queue.
#[async_trait]
pub trait DurableQueue: Send + Sync {
    /// Validate and accept a job. Returns the job id.
    async fn enqueue(
        &self,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<Uuid, QueueError>;

    /// Cancel a job that has not started. Returns whether anything was
    /// cancelled.
    async fn cancel(&self, job_id: Uuid) -> Result<bool, QueueError>;
}

// ── Delivery contract ───────────────────────────────────────────────

/// One delivery of a job to its handler.
#[derive(Debug)]
pub struct JobDelivery<'a> {
    pub job_id: Uuid,
    pub payload: &'a JobPayload,
    /// 1-based delivery attempt.
    pub attempt: u32,
    /// Total attempts the retry policy allows.
    pub max_attempts: u32,
}

impl JobDelivery<'_> {
    /// Whether this is the last attempt the retry policy allows.
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Successful handler outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The job is done (including idempotent skips).
    Completed,
    /// Durable sleep: re-deliver at `until` without consuming an attempt.
    /// The only legitimate long suspension in the system.
    Deferred { until: DateTime<Utc> },
}

/// Handler failure, classified for the retry policy.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Transient — the queue retries with backoff.
    #[error("retryable: {0}")]
    Retryable(String),
    /// Final — no retry; the job is recorded failed.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl JobError {
    pub fn retryable(message: impl std::fmt::Display) -> Self {
        Self::Retryable(message.to_string())
    }

    pub fn fatal(message: impl std::fmt::Display) -> Self {
        Self::Fatal(message.to_string())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Classify a core error for the retry policy.
///
/// Validation errors are structural bugs — retrying cannot fix a malformed
/// payload. Not-found store errors are retried (the row may land shortly;
/// the policy limit bounds the wait). Provider errors carry their own
/// retryability.
impl From<Error> for JobError {
    fn from(err: Error) -> Self {
        match &err {
            Error::Validation(_) => Self::Fatal(err.to_string()),
            // Not-found included: the row may land shortly after the job.
            Error::Store(_) => Self::Retryable(err.to_string()),
            Error::Queue(_) => Self::Retryable(err.to_string()),
            Error::Provider(p) => {
                if p.is_retryable() {
                    Self::Retryable(err.to_string())
                } else {
                    Self::Fatal(err.to_string())
                }
            }
            Error::Summarizer(_) => Self::Retryable(err.to_string()),
        }
    }
}

impl From<ProviderError> for JobError {
    fn from(err: ProviderError) -> Self {
        Self::from(Error::Provider(err))
    }
}

/// Receives deliveries from the queue runtime.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, delivery: JobDelivery<'_>) -> Result<JobOutcome, JobError>;
}

/// Observable job state (memory queue; external queues expose their own).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Waiting for its due time or a concurrency slot.
    Scheduled,
    /// Handler is running.
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording queue fake shared by component unit tests.

    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    /// Captures enqueues without delivering anything.
    #[derive(Default)]
    pub struct RecordingQueue {
        pub enqueued: Mutex<Vec<(JobPayload, EnqueueOptions)>>,
        pub cancelled: Mutex<Vec<Uuid>>,
        pub fail_enqueue: AtomicBool,
    }

    impl RecordingQueue {
        pub fn enqueued_payloads(&self) -> Vec<JobPayload> {
            self.enqueued
                .lock()
                .unwrap()
                .iter()
                .map(|(p, _)| p.clone())
                .collect()
        }

        pub fn count_jobs(&self, name: &str) -> usize {
            self.enqueued
                .lock()
                .unwrap()
                .iter()
                .filter(|(p, _)| p.job_name() == name)
                .count()
        }
    }

    #[async_trait]
    impl DurableQueue for RecordingQueue {
        async fn enqueue(
            &self,
            payload: JobPayload,
            options: EnqueueOptions,
        ) -> Result<Uuid, QueueError> {
            if self.fail_enqueue.load(Ordering::SeqCst) {
                return Err(QueueError::Enqueue("queue unavailable".into()));
            }
            payload
                .validate()
                .map_err(|e| QueueError::Enqueue(e.to_string()))?;
            self.enqueued.lock().unwrap().push((payload, options));
            Ok(Uuid::new_v4())
        }

        async fn cancel(&self, job_id: Uuid) -> Result<bool, QueueError> {
            self.cancelled.lock().unwrap().push(job_id);
            Ok(true)
        }
    }
}

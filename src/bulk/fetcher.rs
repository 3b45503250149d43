//! Bulk fetcher — one mailbox page per invocation.
//!
//! Pagination state is carried entirely by the job payload: the opaque
//! cursor and page counter thread through re-enqueues, never through
//! memory. Exactly one fetcher runs per account at a time (cursors are
//! not safe to share), enforced by the queue's concurrency key.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::bulk::model::{BulkJob, BulkJobStatus};
use crate::error::Result;
use crate::provider::{EmailProvider as _, MessageFilter, ProviderFactory};
use crate::queue::{DurableQueue, EnqueueOptions, JobError, JobPayload};
use crate::store::Database;

/// Queue concurrency key serializing fetches per account.
pub fn fetch_concurrency_key(account_id: &str) -> String {
    format!("bulk-fetch:{account_id}")
}

/// Queue concurrency key bounding workers per account.
pub fn worker_concurrency_key(account_id: &str) -> String {
    format!("bulk-worker:{account_id}")
}

/// One fetch-page invocation, destructured from its payload.
#[derive(Debug, Clone)]
pub struct FetchPageJob {
    pub job_id: Uuid,
    pub account_id: String,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub only_unread: bool,
    pub force_reprocess: bool,
    pub page_token: Option<String>,
    pub page_count: u32,
}

/// Result of one fetch-page invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// A page was fetched and fanned out.
    Page {
        discovered: usize,
        queued: usize,
        has_next: bool,
    },
    /// The job was cancelled; nothing was fetched.
    Cancelled,
    /// The job row is gone or no longer running; stale page delivery.
    Skipped { reason: &'static str },
}

/// Paginates a mailbox and fans out per-message worker jobs.
pub struct BulkFetcher {
    store: Arc<dyn Database>,
    providers: Arc<dyn ProviderFactory>,
    queue: Arc<dyn DurableQueue>,
    page_size: usize,
    worker_concurrency: usize,
}

impl BulkFetcher {
    pub fn new(
        store: Arc<dyn Database>,
        providers: Arc<dyn ProviderFactory>,
        queue: Arc<dyn DurableQueue>,
        page_size: usize,
        worker_concurrency: usize,
    ) -> Self {
        Self {
            store,
            providers,
            queue,
            page_size,
            worker_concurrency,
        }
    }

    /// Create a bulk job and enqueue its first page fetch.
    pub async fn start(
        &self,
        account_id: &str,
        start_date: DateTime<Utc>,
        end_date: Option<DateTime<Utc>>,
        only_unread: bool,
        force_reprocess: bool,
    ) -> Result<BulkJob> {
        let now = Utc::now();
        let job = BulkJob {
            id: Uuid::new_v4(),
            account_id: account_id.to_string(),
            start_date,
            end_date,
            only_unread,
            force_reprocess,
            status: BulkJobStatus::Running,
            pages_fetched: 0,
            total_discovered: 0,
            total_queued: 0,
            processed_count: 0,
            failed_count: 0,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_bulk_job(&job).await?;

        self.enqueue_page(&FetchPageJob {
            job_id: job.id,
            account_id: account_id.to_string(),
            start_date,
            end_date,
            only_unread,
            force_reprocess,
            page_token: None,
            page_count: 0,
        })
        .await?;

        info!(job_id = %job.id, account_id = %account_id, "Started bulk job");
        Ok(job)
    }

    /// Cooperatively cancel a bulk job. In-flight page fetches and
    /// workers observe the flag at their next step boundary.
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        match self.store.get_bulk_job(job_id).await? {
            Some(job) if job.status == BulkJobStatus::Running => {
                self.store
                    .set_bulk_job_status(job_id, BulkJobStatus::Cancelled)
                    .await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Fetch one page, fan out workers, and re-enqueue the next page.
    pub async fn fetch_page(&self, page: &FetchPageJob) -> std::result::Result<FetchOutcome, JobError> {
        // Existence and cancellation checks come before any work.
        let job = match self
            .store
            .get_bulk_job(page.job_id)
            .await
            .map_err(JobError::retryable)?
        {
            Some(job) => job,
            None => {
                return Ok(FetchOutcome::Skipped {
                    reason: "job not found",
                });
            }
        };
        match job.status {
            BulkJobStatus::Cancelled => return Ok(FetchOutcome::Cancelled),
            BulkJobStatus::Running => {}
            _ => {
                return Ok(FetchOutcome::Skipped {
                    reason: "job not running",
                });
            }
        }

        // A fresh client every page: long scans must not outlive an
        // access token.
        let provider = self.providers.resolve(&page.account_id).await?;

        let filter = MessageFilter {
            after: Some(page.start_date),
            before: page.end_date,
            unread_only: page.only_unread,
        };
        let fetched = provider
            .fetch_messages(&filter, page.page_token.as_deref(), self.page_size)
            .await?;
        let discovered = fetched.messages.len();

        // Cross-page dedup: messages a rule already handled are not
        // queued again unless the run forces reprocessing.
        let mut to_queue = Vec::with_capacity(discovered);
        for message in &fetched.messages {
            if !page.force_reprocess
                && self
                    .store
                    .has_rule_execution(&page.account_id, &message.id)
                    .await
                    .map_err(JobError::retryable)?
            {
                continue;
            }
            to_queue.push(message);
        }

        // Counters go up before fan-out so progress is observable even
        // if fan-out partially fails.
        self.store
            .add_bulk_fetch_progress(page.job_id, 1, discovered as u64, to_queue.len() as u64)
            .await
            .map_err(JobError::retryable)?;

        let mut queued = 0usize;
        for message in &to_queue {
            let payload = JobPayload::ProcessMessage {
                job_id: page.job_id,
                account_id: page.account_id.clone(),
                message_id: message.id.clone(),
                thread_id: message.thread_id.clone(),
                force_reprocess: page.force_reprocess,
            };
            let options = EnqueueOptions {
                concurrency_key: Some(worker_concurrency_key(&page.account_id)),
                concurrency_limit: Some(self.worker_concurrency),
                ..Default::default()
            };
            // One failed enqueue must not abort the rest of the page.
            match self.queue.enqueue(payload, options).await {
                Ok(_) => queued += 1,
                Err(e) => {
                    warn!(
                        job_id = %page.job_id,
                        message_id = %message.id,
                        "Worker enqueue failed: {e}"
                    );
                }
            }
        }

        let has_next = fetched.next_page_token.is_some();
        if let Some(next_token) = fetched.next_page_token {
            self.enqueue_page(&FetchPageJob {
                page_token: Some(next_token),
                page_count: page.page_count + 1,
                ..page.clone()
            })
            .await
            .map_err(JobError::retryable)?;
        } else {
            // Cursor absence means the sequence is exhausted.
            self.store
                .set_bulk_job_status(page.job_id, BulkJobStatus::Completed)
                .await
                .map_err(JobError::retryable)?;
            info!(
                job_id = %page.job_id,
                pages = page.page_count + 1,
                "Bulk fetch complete"
            );
        }

        Ok(FetchOutcome::Page {
            discovered,
            queued,
            has_next,
        })
    }

    async fn enqueue_page(&self, page: &FetchPageJob) -> Result<()> {
        let payload = JobPayload::BulkFetchPage {
            job_id: page.job_id,
            account_id: page.account_id.clone(),
            start_date: page.start_date,
            end_date: page.end_date,
            only_unread: page.only_unread,
            force_reprocess: page.force_reprocess,
            page_token: page.page_token.clone(),
            page_count: page.page_count,
        };
        let options = EnqueueOptions {
            concurrency_key: Some(fetch_concurrency_key(&page.account_id)),
            concurrency_limit: Some(1),
            ..Default::default()
        };
        self.queue.enqueue(payload, options).await?;
        Ok(())
    }
}

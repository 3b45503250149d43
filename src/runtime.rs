//! Runtime wiring — components plus the job router.
//!
//! Every component takes its collaborators through constructor injection;
//! there are no process-wide singletons. The router is the single queue
//! handler: it validates payloads, dispatches to the owning component,
//! bounds each delivery with a wall-clock timeout, and owns the
//! failure-outcome → error translation the retry policy depends on.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::actions::executor::{ActionExecutor, ExecutionOutcome};
use crate::actions::scheduler::ActionScheduler;
use crate::actions::sweeper::RecoverySweeper;
use crate::bulk::fetcher::{BulkFetcher, FetchPageJob};
use crate::bulk::worker::{BulkWorker, ProcessJob};
use crate::config::AutomationConfig;
use crate::digest::aggregator::{AddItemJob, DigestAggregator};
use crate::digest::sender::DigestSender;
use crate::provider::ProviderFactory;
use crate::queue::{
    DurableQueue, JobDelivery, JobError, JobHandler, JobOutcome, JobPayload,
};
use crate::rules::RuleEngine;
use crate::store::Database;
use crate::summarizer::Summarizer;

/// External collaborators the automation core is built from.
pub struct AutomationDeps {
    pub store: Arc<dyn Database>,
    pub queue: Arc<dyn DurableQueue>,
    pub providers: Arc<dyn ProviderFactory>,
    pub rules: Arc<dyn RuleEngine>,
    pub summarizer: Arc<dyn Summarizer>,
}

/// The wired automation core.
pub struct Automation {
    pub scheduler: Arc<ActionScheduler>,
    pub executor: Arc<ActionExecutor>,
    pub sweeper: Arc<RecoverySweeper>,
    pub fetcher: Arc<BulkFetcher>,
    pub worker: Arc<BulkWorker>,
    pub aggregator: Arc<DigestAggregator>,
    pub sender: Arc<DigestSender>,
    pub router: Arc<JobRouter>,
}

impl Automation {
    pub fn new(config: &AutomationConfig, deps: AutomationDeps) -> Self {
        let scheduler = Arc::new(ActionScheduler::new(
            deps.store.clone(),
            deps.queue.clone(),
        ));
        let executor = Arc::new(ActionExecutor::new(
            deps.store.clone(),
            deps.providers.clone(),
        ));
        let sweeper = Arc::new(RecoverySweeper::new(
            deps.store.clone(),
            deps.queue.clone(),
            config.sweeper_interval,
            config.sweeper_batch,
        ));
        let fetcher = Arc::new(BulkFetcher::new(
            deps.store.clone(),
            deps.providers.clone(),
            deps.queue.clone(),
            config.fetch_page_size,
            config.worker_concurrency,
        ));
        let worker = Arc::new(BulkWorker::new(
            deps.store.clone(),
            deps.providers.clone(),
            deps.rules.clone(),
            scheduler.clone(),
            deps.queue.clone(),
        ));
        let aggregator = Arc::new(DigestAggregator::new(
            deps.store.clone(),
            deps.summarizer.clone(),
            config.outgoing_address.clone(),
        ));
        let sender = Arc::new(DigestSender::new(
            deps.store.clone(),
            deps.providers.clone(),
            config.digest_batch_size,
            config.digest_chunk_pause,
        ));

        let router = Arc::new(JobRouter {
            executor: executor.clone(),
            sweeper: sweeper.clone(),
            fetcher: fetcher.clone(),
            worker: worker.clone(),
            aggregator: aggregator.clone(),
            sender: sender.clone(),
            job_timeout: config.job_timeout,
        });

        Self {
            scheduler,
            executor,
            sweeper,
            fetcher,
            worker,
            aggregator,
            sender,
            router,
        }
    }
}

/// Dispatches queue deliveries to the owning component.
pub struct JobRouter {
    executor: Arc<ActionExecutor>,
    sweeper: Arc<RecoverySweeper>,
    fetcher: Arc<BulkFetcher>,
    worker: Arc<BulkWorker>,
    aggregator: Arc<DigestAggregator>,
    sender: Arc<DigestSender>,
    job_timeout: Duration,
}

#[async_trait]
impl JobHandler for JobRouter {
    async fn handle(&self, delivery: JobDelivery<'_>) -> Result<JobOutcome, JobError> {
        // Fail fast on malformed payloads before any handler logic.
        delivery
            .payload
            .validate()
            .map_err(|e| JobError::fatal(format!("invalid payload: {e}")))?;

        debug!(
            job = delivery.payload.job_name(),
            job_id = %delivery.job_id,
            attempt = delivery.attempt,
            "Dispatching job"
        );

        match tokio::time::timeout(self.job_timeout, self.dispatch(&delivery)).await {
            Ok(result) => result,
            Err(_) => Err(JobError::retryable(format!(
                "{} timed out after {:?}",
                delivery.payload.job_name(),
                self.job_timeout
            ))),
        }
    }
}

impl JobRouter {
    async fn dispatch(&self, delivery: &JobDelivery<'_>) -> Result<JobOutcome, JobError> {
        match delivery.payload {
            JobPayload::ExecuteAction {
                scheduled_action_id,
                ..
            } => {
                let outcome = self
                    .executor
                    .execute(*scheduled_action_id, delivery.is_final_attempt())
                    .await?;
                Ok(match outcome {
                    ExecutionOutcome::NotDue { until } => JobOutcome::Deferred { until },
                    ExecutionOutcome::Executed { .. } | ExecutionOutcome::Skipped { .. } => {
                        JobOutcome::Completed
                    }
                })
            }

            JobPayload::BulkFetchPage {
                job_id,
                account_id,
                start_date,
                end_date,
                only_unread,
                force_reprocess,
                page_token,
                page_count,
            } => {
                self.fetcher
                    .fetch_page(&FetchPageJob {
                        job_id: *job_id,
                        account_id: account_id.clone(),
                        start_date: *start_date,
                        end_date: *end_date,
                        only_unread: *only_unread,
                        force_reprocess: *force_reprocess,
                        page_token: page_token.clone(),
                        page_count: *page_count,
                    })
                    .await?;
                Ok(JobOutcome::Completed)
            }

            JobPayload::ProcessMessage {
                job_id,
                account_id,
                message_id,
                thread_id,
                force_reprocess,
            } => {
                let outcome = self
                    .worker
                    .process(&ProcessJob {
                        job_id: *job_id,
                        account_id: account_id.clone(),
                        message_id: message_id.clone(),
                        thread_id: thread_id.clone(),
                        force_reprocess: *force_reprocess,
                    })
                    .await
                    .map_err(JobError::from)?;

                // The documented contract: a failure outcome becomes a
                // thrown error here, or the queue would never retry it.
                if outcome.success {
                    Ok(JobOutcome::Completed)
                } else {
                    Err(JobError::retryable(
                        outcome
                            .error
                            .unwrap_or_else(|| "message processing failed".into()),
                    ))
                }
            }

            JobPayload::DigestAddItem {
                account_id,
                action_id,
                cold_email_id,
                message,
            } => {
                self.aggregator
                    .add_item(&AddItemJob {
                        account_id: account_id.clone(),
                        action_id: *action_id,
                        cold_email_id: cold_email_id.clone(),
                        message: message.clone(),
                    })
                    .await
                    .map_err(JobError::from)?;
                Ok(JobOutcome::Completed)
            }

            JobPayload::DigestSend { account_id, force } => {
                self.sender
                    .send(account_id, *force)
                    .await
                    .map_err(JobError::from)?;
                Ok(JobOutcome::Completed)
            }

            JobPayload::SweepStuckActions {} => {
                self.sweeper.sweep().await.map_err(JobError::from)?;
                Ok(JobOutcome::Completed)
            }
        }
    }
}

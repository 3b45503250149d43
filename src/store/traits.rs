//! Unified `Database` trait — single async interface for all persistence.
//!
//! The scheduled-action row is the single source of truth for execution
//! concurrency: every cross-invocation guarantee reduces to a conditional
//! update on its status column, checked by affected-row count. The digest
//! row plays the same role for aggregation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::actions::model::{ActionStatus, ScheduledAction, SchedulingStatus};
use crate::bulk::model::{BulkJob, BulkJobStatus, RuleExecution};
use crate::digest::model::{Digest, DigestItem, DigestSchedule};
use crate::error::StoreError;

/// A mailbox owner known to the system.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    /// The user's own address.
    pub email: String,
    /// The assistant address that sends on this account's behalf, if any.
    /// Digest aggregation drops mail from this sender (self-loop guard).
    pub assistant_email: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields of a digest item upsert.
#[derive(Debug, Clone)]
pub struct DigestItemUpsert<'a> {
    pub digest_id: Uuid,
    pub message_id: &'a str,
    pub thread_id: &'a str,
    pub rule_name: &'a str,
    pub content: &'a str,
    pub rule_execution_id: Option<Uuid>,
    pub cold_email_id: Option<&'a str>,
}

/// Backend-agnostic persistence trait covering accounts, scheduled
/// actions, bulk jobs, rule executions, and digests.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), StoreError>;

    // ── Accounts ────────────────────────────────────────────────────

    async fn insert_account(&self, account: &Account) -> Result<(), StoreError>;

    async fn get_account(&self, account_id: &str) -> Result<Option<Account>, StoreError>;

    // ── Scheduled actions ───────────────────────────────────────────

    /// Insert a new action row (status PENDING).
    async fn insert_scheduled_action(&self, action: &ScheduledAction) -> Result<(), StoreError>;

    async fn get_scheduled_action(&self, id: Uuid)
    -> Result<Option<ScheduledAction>, StoreError>;

    /// Conditional status transition: `UPDATE … WHERE id = ? AND status
    /// = from`. Returns whether exactly this call took the edge. For any
    /// one (id, from) pair, at most one concurrent caller observes true.
    async fn try_transition_action(
        &self,
        id: Uuid,
        from: ActionStatus,
        to: ActionStatus,
    ) -> Result<bool, StoreError>;

    /// Record a terminal result. `status` must be COMPLETED or FAILED.
    async fn finish_action(
        &self,
        id: Uuid,
        status: ActionStatus,
        result_id: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Record the external queue outcome for tracing.
    async fn set_scheduling_status(
        &self,
        id: Uuid,
        status: SchedulingStatus,
        external_job_id: Option<&str>,
    ) -> Result<(), StoreError>;

    /// PENDING actions with `scheduled_for <= now`, oldest first.
    async fn list_due_pending_actions(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledAction>, StoreError>;

    // ── Bulk jobs ───────────────────────────────────────────────────

    async fn insert_bulk_job(&self, job: &BulkJob) -> Result<(), StoreError>;

    async fn get_bulk_job(&self, id: Uuid) -> Result<Option<BulkJob>, StoreError>;

    async fn set_bulk_job_status(
        &self,
        id: Uuid,
        status: BulkJobStatus,
    ) -> Result<(), StoreError>;

    /// Increment fetch-side progress counters.
    async fn add_bulk_fetch_progress(
        &self,
        id: Uuid,
        pages: u32,
        discovered: u64,
        queued: u64,
    ) -> Result<(), StoreError>;

    /// Increment the processed or failed worker counter.
    async fn record_bulk_outcome(&self, id: Uuid, success: bool) -> Result<(), StoreError>;

    // ── Rule executions ─────────────────────────────────────────────

    /// Insert, ignoring a duplicate (account_id, message_id) pair.
    async fn insert_rule_execution(&self, execution: &RuleExecution) -> Result<(), StoreError>;

    async fn get_rule_execution(&self, id: Uuid) -> Result<Option<RuleExecution>, StoreError>;

    async fn has_rule_execution(
        &self,
        account_id: &str,
        message_id: &str,
    ) -> Result<bool, StoreError>;

    // ── Digests ─────────────────────────────────────────────────────

    /// The account's oldest PENDING digest, created if none exists.
    async fn find_or_create_pending_digest(
        &self,
        account_id: &str,
    ) -> Result<Digest, StoreError>;

    async fn get_digest(&self, id: Uuid) -> Result<Option<Digest>, StoreError>;

    /// Update the item matching (digest_id, message_id, thread_id) or
    /// create it. Returns true when a new item was created.
    async fn upsert_digest_item(&self, item: DigestItemUpsert<'_>) -> Result<bool, StoreError>;

    /// Atomically mark every PENDING digest of the account PROCESSING
    /// and return the claimed rows. A concurrent claimer gets none of
    /// them.
    async fn claim_pending_digests(&self, account_id: &str) -> Result<Vec<Digest>, StoreError>;

    async fn list_digest_items(
        &self,
        digest_ids: &[Uuid],
    ) -> Result<Vec<DigestItem>, StoreError>;

    /// One transaction: write the advanced digest schedule (when given),
    /// mark the digests SENT, and redact every item's content. All or
    /// nothing.
    async fn finalize_digests_sent(
        &self,
        digest_ids: &[Uuid],
        sent_at: DateTime<Utc>,
        schedule: Option<&DigestSchedule>,
    ) -> Result<(), StoreError>;

    /// Mark digests FAILED, leaving item content intact for retry/audit.
    async fn mark_digests_failed(&self, digest_ids: &[Uuid]) -> Result<(), StoreError>;

    async fn get_digest_schedule(
        &self,
        account_id: &str,
    ) -> Result<Option<DigestSchedule>, StoreError>;

    async fn upsert_digest_schedule(&self, schedule: &DigestSchedule) -> Result<(), StoreError>;
}

//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. All conditional
//! transitions are expressed as `UPDATE … WHERE` statements whose
//! affected-row count decides the outcome — never read-then-write.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::info;
use uuid::Uuid;

use crate::actions::model::{
    ActionKind, ActionPayload, ActionStatus, ScheduledAction, SchedulingStatus,
};
use crate::bulk::model::{BulkJob, BulkJobStatus, RuleExecution};
use crate::digest::model::{
    Digest, DigestItem, DigestSchedule, DigestStatus, REDACTED_CONTENT,
};
use crate::error::StoreError;
use crate::store::migrations;
use crate::store::traits::{Account, Database, DigestItemUpsert};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to open database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests and ephemeral runs).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn query_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Query(e.to_string())
}

/// NULL-or-text parameter value.
fn opt_text(value: Option<String>) -> libsql::Value {
    match value {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| parse_datetime(&s))
}

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_else(|_| Uuid::nil())
}

/// Column order shared by every scheduled_actions SELECT.
const ACTION_COLUMNS: &str = "id, account_id, rule_execution_id, message_id, thread_id, kind, \
     payload, status, scheduled_for, executed_at, result_id, error, \
     created_at, updated_at, external_job_id, scheduling_status";

fn row_to_action(row: &libsql::Row) -> Result<ScheduledAction, StoreError> {
    let id: String = row.get(0).map_err(query_err)?;
    let account_id: String = row.get(1).map_err(query_err)?;
    let rule_execution_id: Option<String> = row.get(2).ok();
    let message_id: String = row.get(3).map_err(query_err)?;
    let thread_id: String = row.get(4).map_err(query_err)?;
    let kind_str: String = row.get(5).map_err(query_err)?;
    let payload_str: String = row.get(6).map_err(query_err)?;
    let status_str: String = row.get(7).map_err(query_err)?;
    let scheduled_for: String = row.get(8).map_err(query_err)?;
    let executed_at: Option<String> = row.get(9).ok();
    let result_id: Option<String> = row.get(10).ok();
    let error: Option<String> = row.get(11).ok();
    let created_at: String = row.get(12).map_err(query_err)?;
    let updated_at: String = row.get(13).map_err(query_err)?;
    let external_job_id: Option<String> = row.get(14).ok();
    let scheduling_status: Option<String> = row.get(15).ok();

    let kind = ActionKind::parse(&kind_str).ok_or_else(|| {
        StoreError::Serialization(format!("unknown action kind '{kind_str}'"))
    })?;
    let status = ActionStatus::parse(&status_str).ok_or_else(|| {
        StoreError::Serialization(format!("unknown action status '{status_str}'"))
    })?;
    let payload: ActionPayload = serde_json::from_str(&payload_str)
        .map_err(|e| StoreError::Serialization(format!("action payload: {e}")))?;

    Ok(ScheduledAction {
        id: parse_uuid(&id),
        account_id,
        rule_execution_id: rule_execution_id.as_deref().map(parse_uuid),
        message_id,
        thread_id,
        kind,
        payload,
        status,
        scheduled_for: parse_datetime(&scheduled_for),
        external_job_id,
        scheduling_status: scheduling_status.as_deref().and_then(SchedulingStatus::parse),
        executed_at: parse_optional_datetime(executed_at),
        result_id,
        error,
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
    })
}

const BULK_JOB_COLUMNS: &str = "id, account_id, start_date, end_date, only_unread, \
     force_reprocess, status, pages_fetched, total_discovered, total_queued, \
     processed_count, failed_count, created_at, updated_at";

fn row_to_bulk_job(row: &libsql::Row) -> Result<BulkJob, StoreError> {
    let id: String = row.get(0).map_err(query_err)?;
    let account_id: String = row.get(1).map_err(query_err)?;
    let start_date: String = row.get(2).map_err(query_err)?;
    let end_date: Option<String> = row.get(3).ok();
    let only_unread: i64 = row.get(4).map_err(query_err)?;
    let force_reprocess: i64 = row.get(5).map_err(query_err)?;
    let status_str: String = row.get(6).map_err(query_err)?;
    let pages_fetched: i64 = row.get(7).map_err(query_err)?;
    let total_discovered: i64 = row.get(8).map_err(query_err)?;
    let total_queued: i64 = row.get(9).map_err(query_err)?;
    let processed_count: i64 = row.get(10).map_err(query_err)?;
    let failed_count: i64 = row.get(11).map_err(query_err)?;
    let created_at: String = row.get(12).map_err(query_err)?;
    let updated_at: String = row.get(13).map_err(query_err)?;

    let status = BulkJobStatus::parse(&status_str).ok_or_else(|| {
        StoreError::Serialization(format!("unknown bulk job status '{status_str}'"))
    })?;

    Ok(BulkJob {
        id: parse_uuid(&id),
        account_id,
        start_date: parse_datetime(&start_date),
        end_date: parse_optional_datetime(end_date),
        only_unread: only_unread != 0,
        force_reprocess: force_reprocess != 0,
        status,
        pages_fetched: pages_fetched.max(0) as u32,
        total_discovered: total_discovered.max(0) as u64,
        total_queued: total_queued.max(0) as u64,
        processed_count: processed_count.max(0) as u64,
        failed_count: failed_count.max(0) as u64,
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
    })
}

const DIGEST_COLUMNS: &str = "id, account_id, status, created_at, sent_at";

fn row_to_digest(row: &libsql::Row) -> Result<Digest, StoreError> {
    let id: String = row.get(0).map_err(query_err)?;
    let account_id: String = row.get(1).map_err(query_err)?;
    let status_str: String = row.get(2).map_err(query_err)?;
    let created_at: String = row.get(3).map_err(query_err)?;
    let sent_at: Option<String> = row.get(4).ok();

    let status = DigestStatus::parse(&status_str).ok_or_else(|| {
        StoreError::Serialization(format!("unknown digest status '{status_str}'"))
    })?;

    Ok(Digest {
        id: parse_uuid(&id),
        account_id,
        status,
        created_at: parse_datetime(&created_at),
        sent_at: parse_optional_datetime(sent_at),
    })
}

const DIGEST_ITEM_COLUMNS: &str = "id, digest_id, message_id, thread_id, rule_name, content, \
     rule_execution_id, cold_email_id, created_at, updated_at";

fn row_to_digest_item(row: &libsql::Row) -> Result<DigestItem, StoreError> {
    let id: String = row.get(0).map_err(query_err)?;
    let digest_id: String = row.get(1).map_err(query_err)?;
    let message_id: String = row.get(2).map_err(query_err)?;
    let thread_id: String = row.get(3).map_err(query_err)?;
    let rule_name: String = row.get(4).map_err(query_err)?;
    let content: String = row.get(5).map_err(query_err)?;
    let rule_execution_id: Option<String> = row.get(6).ok();
    let cold_email_id: Option<String> = row.get(7).ok();
    let created_at: String = row.get(8).map_err(query_err)?;
    let updated_at: String = row.get(9).map_err(query_err)?;

    Ok(DigestItem {
        id: parse_uuid(&id),
        digest_id: parse_uuid(&digest_id),
        message_id,
        thread_id,
        rule_name,
        content,
        rule_execution_id: rule_execution_id.as_deref().map(parse_uuid),
        cold_email_id,
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), StoreError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Accounts ────────────────────────────────────────────────────

    async fn insert_account(&self, account: &Account) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO accounts (id, email, assistant_email, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    account.id.clone(),
                    account.email.clone(),
                    opt_text(account.assistant_email.clone()),
                    account.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_account(&self, account_id: &str) -> Result<Option<Account>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, email, assistant_email, created_at FROM accounts WHERE id = ?1",
                params![account_id],
            )
            .await
            .map_err(query_err)?;
        let Some(row) = rows.next().await.map_err(query_err)? else {
            return Ok(None);
        };
        let id: String = row.get(0).map_err(query_err)?;
        let email: String = row.get(1).map_err(query_err)?;
        let assistant_email: Option<String> = row.get(2).ok();
        let created_at: String = row.get(3).map_err(query_err)?;
        Ok(Some(Account {
            id,
            email,
            assistant_email,
            created_at: parse_datetime(&created_at),
        }))
    }

    // ── Scheduled actions ───────────────────────────────────────────

    async fn insert_scheduled_action(&self, action: &ScheduledAction) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&action.payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                "INSERT INTO scheduled_actions
                    (id, account_id, rule_execution_id, message_id, thread_id, kind,
                     payload, status, scheduled_for, executed_at, result_id, error,
                     created_at, updated_at, external_job_id, scheduling_status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    action.id.to_string(),
                    action.account_id.clone(),
                    opt_text(action.rule_execution_id.map(|u| u.to_string())),
                    action.message_id.clone(),
                    action.thread_id.clone(),
                    action.kind.as_str(),
                    payload,
                    action.status.as_str(),
                    action.scheduled_for.to_rfc3339(),
                    opt_text(action.executed_at.map(|t| t.to_rfc3339())),
                    opt_text(action.result_id.clone()),
                    opt_text(action.error.clone()),
                    action.created_at.to_rfc3339(),
                    action.updated_at.to_rfc3339(),
                    opt_text(action.external_job_id.clone()),
                    opt_text(action.scheduling_status.map(|s| s.as_str().to_string())),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_scheduled_action(
        &self,
        id: Uuid,
    ) -> Result<Option<ScheduledAction>, StoreError> {
        let sql = format!("SELECT {ACTION_COLUMNS} FROM scheduled_actions WHERE id = ?1");
        let mut rows = self
            .conn()
            .query(&sql, params![id.to_string()])
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_action(&row)?)),
            None => Ok(None),
        }
    }

    async fn try_transition_action(
        &self,
        id: Uuid,
        from: ActionStatus,
        to: ActionStatus,
    ) -> Result<bool, StoreError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE scheduled_actions SET status = ?1, updated_at = ?2
                 WHERE id = ?3 AND status = ?4",
                params![
                    to.as_str(),
                    Utc::now().to_rfc3339(),
                    id.to_string(),
                    from.as_str(),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(affected == 1)
    }

    async fn finish_action(
        &self,
        id: Uuid,
        status: ActionStatus,
        result_id: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "UPDATE scheduled_actions
                 SET status = ?1, executed_at = ?2, result_id = ?3, error = ?4, updated_at = ?2
                 WHERE id = ?5",
                params![
                    status.as_str(),
                    now,
                    opt_text(result_id.map(str::to_string)),
                    opt_text(error.map(str::to_string)),
                    id.to_string(),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn set_scheduling_status(
        &self,
        id: Uuid,
        status: SchedulingStatus,
        external_job_id: Option<&str>,
    ) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE scheduled_actions
                 SET scheduling_status = ?1,
                     external_job_id = COALESCE(?2, external_job_id),
                     updated_at = ?3
                 WHERE id = ?4",
                params![
                    status.as_str(),
                    opt_text(external_job_id.map(str::to_string)),
                    Utc::now().to_rfc3339(),
                    id.to_string(),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn list_due_pending_actions(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledAction>, StoreError> {
        let sql = format!(
            "SELECT {ACTION_COLUMNS} FROM scheduled_actions
             WHERE status = 'pending' AND scheduled_for <= ?1
             ORDER BY scheduled_for ASC
             LIMIT ?2"
        );
        let mut rows = self
            .conn()
            .query(&sql, params![now.to_rfc3339(), limit as i64])
            .await
            .map_err(query_err)?;
        let mut actions = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            actions.push(row_to_action(&row)?);
        }
        Ok(actions)
    }

    // ── Bulk jobs ───────────────────────────────────────────────────

    async fn insert_bulk_job(&self, job: &BulkJob) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO bulk_jobs
                    (id, account_id, start_date, end_date, only_unread, force_reprocess,
                     status, pages_fetched, total_discovered, total_queued,
                     processed_count, failed_count, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    job.id.to_string(),
                    job.account_id.clone(),
                    job.start_date.to_rfc3339(),
                    opt_text(job.end_date.map(|t| t.to_rfc3339())),
                    job.only_unread as i64,
                    job.force_reprocess as i64,
                    job.status.as_str(),
                    job.pages_fetched as i64,
                    job.total_discovered as i64,
                    job.total_queued as i64,
                    job.processed_count as i64,
                    job.failed_count as i64,
                    job.created_at.to_rfc3339(),
                    job.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_bulk_job(&self, id: Uuid) -> Result<Option<BulkJob>, StoreError> {
        let sql = format!("SELECT {BULK_JOB_COLUMNS} FROM bulk_jobs WHERE id = ?1");
        let mut rows = self
            .conn()
            .query(&sql, params![id.to_string()])
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_bulk_job(&row)?)),
            None => Ok(None),
        }
    }

    async fn set_bulk_job_status(
        &self,
        id: Uuid,
        status: BulkJobStatus,
    ) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE bulk_jobs SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn add_bulk_fetch_progress(
        &self,
        id: Uuid,
        pages: u32,
        discovered: u64,
        queued: u64,
    ) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE bulk_jobs
                 SET pages_fetched = pages_fetched + ?1,
                     total_discovered = total_discovered + ?2,
                     total_queued = total_queued + ?3,
                     updated_at = ?4
                 WHERE id = ?5",
                params![
                    pages as i64,
                    discovered as i64,
                    queued as i64,
                    Utc::now().to_rfc3339(),
                    id.to_string(),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn record_bulk_outcome(&self, id: Uuid, success: bool) -> Result<(), StoreError> {
        let column = if success {
            "processed_count"
        } else {
            "failed_count"
        };
        let sql = format!(
            "UPDATE bulk_jobs SET {column} = {column} + 1, updated_at = ?1 WHERE id = ?2"
        );
        self.conn()
            .execute(&sql, params![Utc::now().to_rfc3339(), id.to_string()])
            .await
            .map_err(query_err)?;
        Ok(())
    }

    // ── Rule executions ─────────────────────────────────────────────

    async fn insert_rule_execution(&self, execution: &RuleExecution) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO rule_executions
                    (id, account_id, message_id, thread_id, rule_name, executed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    execution.id.to_string(),
                    execution.account_id.clone(),
                    execution.message_id.clone(),
                    execution.thread_id.clone(),
                    execution.rule_name.clone(),
                    execution.executed_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_rule_execution(&self, id: Uuid) -> Result<Option<RuleExecution>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, account_id, message_id, thread_id, rule_name, executed_at
                 FROM rule_executions WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;
        let Some(row) = rows.next().await.map_err(query_err)? else {
            return Ok(None);
        };
        let id_str: String = row.get(0).map_err(query_err)?;
        let account_id: String = row.get(1).map_err(query_err)?;
        let message_id: String = row.get(2).map_err(query_err)?;
        let thread_id: String = row.get(3).map_err(query_err)?;
        let rule_name: String = row.get(4).map_err(query_err)?;
        let executed_at: String = row.get(5).map_err(query_err)?;
        Ok(Some(RuleExecution {
            id: parse_uuid(&id_str),
            account_id,
            message_id,
            thread_id,
            rule_name,
            executed_at: parse_datetime(&executed_at),
        }))
    }

    async fn has_rule_execution(
        &self,
        account_id: &str,
        message_id: &str,
    ) -> Result<bool, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM rule_executions
                 WHERE account_id = ?1 AND message_id = ?2",
                params![account_id, message_id],
            )
            .await
            .map_err(query_err)?;
        let row = rows.next().await.map_err(query_err)?;
        let count: i64 = row.map(|r| r.get(0).unwrap_or(0)).unwrap_or(0);
        Ok(count > 0)
    }

    // ── Digests ─────────────────────────────────────────────────────

    async fn find_or_create_pending_digest(
        &self,
        account_id: &str,
    ) -> Result<Digest, StoreError> {
        let sql = format!(
            "SELECT {DIGEST_COLUMNS} FROM digests
             WHERE account_id = ?1 AND status = 'pending'
             ORDER BY created_at ASC
             LIMIT 1"
        );
        let mut rows = self
            .conn()
            .query(&sql, params![account_id])
            .await
            .map_err(query_err)?;
        if let Some(row) = rows.next().await.map_err(query_err)? {
            return row_to_digest(&row);
        }

        let digest = Digest {
            id: Uuid::new_v4(),
            account_id: account_id.to_string(),
            status: DigestStatus::Pending,
            created_at: Utc::now(),
            sent_at: None,
        };
        self.conn()
            .execute(
                "INSERT INTO digests (id, account_id, status, created_at, sent_at)
                 VALUES (?1, ?2, ?3, ?4, NULL)",
                params![
                    digest.id.to_string(),
                    digest.account_id.clone(),
                    digest.status.as_str(),
                    digest.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(digest)
    }

    async fn get_digest(&self, id: Uuid) -> Result<Option<Digest>, StoreError> {
        let sql = format!("SELECT {DIGEST_COLUMNS} FROM digests WHERE id = ?1");
        let mut rows = self
            .conn()
            .query(&sql, params![id.to_string()])
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_digest(&row)?)),
            None => Ok(None),
        }
    }

    async fn upsert_digest_item(&self, item: DigestItemUpsert<'_>) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();
        let affected = self
            .conn()
            .execute(
                "UPDATE digest_items
                 SET content = ?1, rule_name = ?2, updated_at = ?3
                 WHERE digest_id = ?4 AND message_id = ?5 AND thread_id = ?6",
                params![
                    item.content,
                    item.rule_name,
                    now.clone(),
                    item.digest_id.to_string(),
                    item.message_id,
                    item.thread_id,
                ],
            )
            .await
            .map_err(query_err)?;
        if affected > 0 {
            return Ok(false);
        }

        self.conn()
            .execute(
                "INSERT INTO digest_items
                    (id, digest_id, message_id, thread_id, rule_name, content,
                     rule_execution_id, cold_email_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
                 ON CONFLICT (digest_id, message_id, thread_id) DO UPDATE
                 SET content = excluded.content,
                     rule_name = excluded.rule_name,
                     updated_at = excluded.updated_at",
                params![
                    Uuid::new_v4().to_string(),
                    item.digest_id.to_string(),
                    item.message_id,
                    item.thread_id,
                    item.rule_name,
                    item.content,
                    opt_text(item.rule_execution_id.map(|u| u.to_string())),
                    opt_text(item.cold_email_id.map(str::to_string)),
                    now,
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(true)
    }

    async fn claim_pending_digests(&self, account_id: &str) -> Result<Vec<Digest>, StoreError> {
        // UPDATE … RETURNING makes the claim atomic: a concurrent sender
        // run gets zero rows back.
        let sql = format!(
            "UPDATE digests SET status = 'processing'
             WHERE account_id = ?1 AND status = 'pending'
             RETURNING {DIGEST_COLUMNS}"
        );
        let mut rows = self
            .conn()
            .query(&sql, params![account_id])
            .await
            .map_err(query_err)?;
        let mut digests = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            digests.push(row_to_digest(&row)?);
        }
        Ok(digests)
    }

    async fn list_digest_items(
        &self,
        digest_ids: &[Uuid],
    ) -> Result<Vec<DigestItem>, StoreError> {
        let mut items = Vec::new();
        for digest_id in digest_ids {
            let sql = format!(
                "SELECT {DIGEST_ITEM_COLUMNS} FROM digest_items
                 WHERE digest_id = ?1 ORDER BY created_at ASC"
            );
            let mut rows = self
                .conn()
                .query(&sql, params![digest_id.to_string()])
                .await
                .map_err(query_err)?;
            while let Some(row) = rows.next().await.map_err(query_err)? {
                items.push(row_to_digest_item(&row)?);
            }
        }
        Ok(items)
    }

    async fn finalize_digests_sent(
        &self,
        digest_ids: &[Uuid],
        sent_at: DateTime<Utc>,
        schedule: Option<&DigestSchedule>,
    ) -> Result<(), StoreError> {
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| StoreError::Transaction(e.to_string()))?;

        let result = async {
            if let Some(schedule) = schedule {
                tx.execute(
                    "INSERT INTO digest_schedules
                        (account_id, cron_expression, last_occurrence, next_occurrence)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT (account_id) DO UPDATE
                     SET cron_expression = excluded.cron_expression,
                         last_occurrence = excluded.last_occurrence,
                         next_occurrence = excluded.next_occurrence",
                    params![
                        schedule.account_id.clone(),
                        schedule.cron_expression.clone(),
                        opt_text(schedule.last_occurrence.map(|t| t.to_rfc3339())),
                        opt_text(schedule.next_occurrence.map(|t| t.to_rfc3339())),
                    ],
                )
                .await
                .map_err(query_err)?;
            }

            for digest_id in digest_ids {
                tx.execute(
                    "UPDATE digests SET status = 'sent', sent_at = ?1 WHERE id = ?2",
                    params![sent_at.to_rfc3339(), digest_id.to_string()],
                )
                .await
                .map_err(query_err)?;
                tx.execute(
                    "UPDATE digest_items SET content = ?1, updated_at = ?2
                     WHERE digest_id = ?3",
                    params![
                        REDACTED_CONTENT,
                        sent_at.to_rfc3339(),
                        digest_id.to_string(),
                    ],
                )
                .await
                .map_err(query_err)?;
            }
            Ok::<(), StoreError>(())
        }
        .await;

        match result {
            Ok(()) => tx
                .commit()
                .await
                .map_err(|e| StoreError::Transaction(e.to_string())),
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn mark_digests_failed(&self, digest_ids: &[Uuid]) -> Result<(), StoreError> {
        for digest_id in digest_ids {
            self.conn()
                .execute(
                    "UPDATE digests SET status = 'failed' WHERE id = ?1",
                    params![digest_id.to_string()],
                )
                .await
                .map_err(query_err)?;
        }
        Ok(())
    }

    async fn get_digest_schedule(
        &self,
        account_id: &str,
    ) -> Result<Option<DigestSchedule>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT account_id, cron_expression, last_occurrence, next_occurrence
                 FROM digest_schedules WHERE account_id = ?1",
                params![account_id],
            )
            .await
            .map_err(query_err)?;
        let Some(row) = rows.next().await.map_err(query_err)? else {
            return Ok(None);
        };
        let account_id: String = row.get(0).map_err(query_err)?;
        let cron_expression: String = row.get(1).map_err(query_err)?;
        let last_occurrence: Option<String> = row.get(2).ok();
        let next_occurrence: Option<String> = row.get(3).ok();
        Ok(Some(DigestSchedule {
            account_id,
            cron_expression,
            last_occurrence: parse_optional_datetime(last_occurrence),
            next_occurrence: parse_optional_datetime(next_occurrence),
        }))
    }

    async fn upsert_digest_schedule(&self, schedule: &DigestSchedule) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO digest_schedules
                    (account_id, cron_expression, last_occurrence, next_occurrence)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (account_id) DO UPDATE
                 SET cron_expression = excluded.cron_expression,
                     last_occurrence = excluded.last_occurrence,
                     next_occurrence = excluded.next_occurrence",
                params![
                    schedule.account_id.clone(),
                    schedule.cron_expression.clone(),
                    opt_text(schedule.last_occurrence.map(|t| t.to_rfc3339())),
                    opt_text(schedule.next_occurrence.map(|t| t.to_rfc3339())),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::model::ActionPayload;

    async fn backend() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn pending_action(scheduled_for: DateTime<Utc>) -> ScheduledAction {
        let now = Utc::now();
        ScheduledAction {
            id: Uuid::new_v4(),
            account_id: "acct-1".into(),
            rule_execution_id: None,
            message_id: "m1".into(),
            thread_id: "t1".into(),
            kind: ActionKind::Archive,
            payload: ActionPayload::default(),
            status: ActionStatus::Pending,
            scheduled_for,
            external_job_id: None,
            scheduling_status: None,
            executed_at: None,
            result_id: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn action_round_trip() {
        let db = backend().await;
        let mut action = pending_action(Utc::now() + chrono::Duration::minutes(30));
        action.payload.label = Some("Newsletter".into());
        action.payload.to = vec!["alice@example.com".into()];
        db.insert_scheduled_action(&action).await.unwrap();

        let loaded = db.get_scheduled_action(action.id).await.unwrap().unwrap();
        assert_eq!(loaded.account_id, "acct-1");
        assert_eq!(loaded.kind, ActionKind::Archive);
        assert_eq!(loaded.status, ActionStatus::Pending);
        assert_eq!(loaded.payload.label.as_deref(), Some("Newsletter"));
        assert_eq!(loaded.payload.to, vec!["alice@example.com".to_string()]);
    }

    #[tokio::test]
    async fn cas_transition_succeeds_once() {
        let db = backend().await;
        let action = pending_action(Utc::now());
        db.insert_scheduled_action(&action).await.unwrap();

        let first = db
            .try_transition_action(action.id, ActionStatus::Pending, ActionStatus::Executing)
            .await
            .unwrap();
        let second = db
            .try_transition_action(action.id, ActionStatus::Pending, ActionStatus::Executing)
            .await
            .unwrap();
        assert!(first);
        assert!(!second);

        let loaded = db.get_scheduled_action(action.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ActionStatus::Executing);
    }

    #[tokio::test]
    async fn cas_respects_expected_from_status() {
        let db = backend().await;
        let action = pending_action(Utc::now());
        db.insert_scheduled_action(&action).await.unwrap();

        // Cancelling an already-executing row must fail.
        assert!(
            db.try_transition_action(action.id, ActionStatus::Pending, ActionStatus::Executing)
                .await
                .unwrap()
        );
        assert!(
            !db.try_transition_action(action.id, ActionStatus::Pending, ActionStatus::Cancelled)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn due_pending_query_orders_oldest_first() {
        let db = backend().await;
        let now = Utc::now();
        let older = pending_action(now - chrono::Duration::hours(2));
        let newer = pending_action(now - chrono::Duration::hours(1));
        let future = pending_action(now + chrono::Duration::hours(1));
        db.insert_scheduled_action(&newer).await.unwrap();
        db.insert_scheduled_action(&older).await.unwrap();
        db.insert_scheduled_action(&future).await.unwrap();

        let due = db.list_due_pending_actions(now, 100).await.unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].id, older.id);
        assert_eq!(due[1].id, newer.id);
    }

    #[tokio::test]
    async fn finish_action_records_result() {
        let db = backend().await;
        let action = pending_action(Utc::now());
        db.insert_scheduled_action(&action).await.unwrap();
        db.finish_action(action.id, ActionStatus::Completed, Some("res-1"), None)
            .await
            .unwrap();

        let loaded = db.get_scheduled_action(action.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ActionStatus::Completed);
        assert_eq!(loaded.result_id.as_deref(), Some("res-1"));
        assert!(loaded.executed_at.is_some());
    }

    #[tokio::test]
    async fn scheduling_status_is_traced() {
        let db = backend().await;
        let action = pending_action(Utc::now());
        db.insert_scheduled_action(&action).await.unwrap();
        db.set_scheduling_status(action.id, SchedulingStatus::Scheduled, Some("q-42"))
            .await
            .unwrap();

        let loaded = db.get_scheduled_action(action.id).await.unwrap().unwrap();
        assert_eq!(loaded.scheduling_status, Some(SchedulingStatus::Scheduled));
        assert_eq!(loaded.external_job_id.as_deref(), Some("q-42"));
    }

    #[tokio::test]
    async fn bulk_job_counters_accumulate() {
        let db = backend().await;
        let now = Utc::now();
        let job = BulkJob {
            id: Uuid::new_v4(),
            account_id: "acct-1".into(),
            start_date: now - chrono::Duration::days(30),
            end_date: None,
            only_unread: false,
            force_reprocess: false,
            status: BulkJobStatus::Running,
            pages_fetched: 0,
            total_discovered: 0,
            total_queued: 0,
            processed_count: 0,
            failed_count: 0,
            created_at: now,
            updated_at: now,
        };
        db.insert_bulk_job(&job).await.unwrap();
        db.add_bulk_fetch_progress(job.id, 1, 25, 25).await.unwrap();
        db.add_bulk_fetch_progress(job.id, 1, 10, 8).await.unwrap();
        db.record_bulk_outcome(job.id, true).await.unwrap();
        db.record_bulk_outcome(job.id, false).await.unwrap();

        let loaded = db.get_bulk_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.pages_fetched, 2);
        assert_eq!(loaded.total_discovered, 35);
        assert_eq!(loaded.total_queued, 33);
        assert_eq!(loaded.processed_count, 1);
        assert_eq!(loaded.failed_count, 1);
    }

    #[tokio::test]
    async fn rule_execution_dedup() {
        let db = backend().await;
        let execution = RuleExecution {
            id: Uuid::new_v4(),
            account_id: "acct-1".into(),
            message_id: "m1".into(),
            thread_id: "t1".into(),
            rule_name: "Newsletters".into(),
            executed_at: Utc::now(),
        };
        db.insert_rule_execution(&execution).await.unwrap();
        assert!(db.has_rule_execution("acct-1", "m1").await.unwrap());
        assert!(!db.has_rule_execution("acct-1", "m2").await.unwrap());

        // Duplicate insert for the same (account, message) is ignored.
        let duplicate = RuleExecution {
            id: Uuid::new_v4(),
            ..execution.clone()
        };
        db.insert_rule_execution(&duplicate).await.unwrap();
        let loaded = db.get_rule_execution(execution.id).await.unwrap();
        assert!(loaded.is_some());
        assert!(db.get_rule_execution(duplicate.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn find_or_create_reuses_pending_digest() {
        let db = backend().await;
        let first = db.find_or_create_pending_digest("acct-1").await.unwrap();
        let second = db.find_or_create_pending_digest("acct-1").await.unwrap();
        assert_eq!(first.id, second.id);

        let other = db.find_or_create_pending_digest("acct-2").await.unwrap();
        assert_ne!(first.id, other.id);
    }

    #[tokio::test]
    async fn digest_item_upsert_is_idempotent() {
        let db = backend().await;
        let digest = db.find_or_create_pending_digest("acct-1").await.unwrap();

        let created = db
            .upsert_digest_item(DigestItemUpsert {
                digest_id: digest.id,
                message_id: "m1",
                thread_id: "t1",
                rule_name: "Newsletters",
                content: "{\"summary\":\"v1\"}",
                rule_execution_id: None,
                cold_email_id: None,
            })
            .await
            .unwrap();
        assert!(created);

        let created_again = db
            .upsert_digest_item(DigestItemUpsert {
                digest_id: digest.id,
                message_id: "m1",
                thread_id: "t1",
                rule_name: "Newsletters",
                content: "{\"summary\":\"v2\"}",
                rule_execution_id: None,
                cold_email_id: None,
            })
            .await
            .unwrap();
        assert!(!created_again);

        let items = db.list_digest_items(&[digest.id]).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].content, "{\"summary\":\"v2\"}");
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let db = backend().await;
        let digest = db.find_or_create_pending_digest("acct-1").await.unwrap();

        let claimed = db.claim_pending_digests("acct-1").await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, digest.id);

        // The second claim sees nothing pending.
        let claimed_again = db.claim_pending_digests("acct-1").await.unwrap();
        assert!(claimed_again.is_empty());
    }

    #[tokio::test]
    async fn finalize_marks_sent_and_redacts() {
        let db = backend().await;
        let digest = db.find_or_create_pending_digest("acct-1").await.unwrap();
        db.upsert_digest_item(DigestItemUpsert {
            digest_id: digest.id,
            message_id: "m1",
            thread_id: "t1",
            rule_name: "Newsletters",
            content: "{\"summary\":\"secret\"}",
            rule_execution_id: None,
            cold_email_id: None,
        })
        .await
        .unwrap();
        db.claim_pending_digests("acct-1").await.unwrap();

        let sent_at = Utc::now();
        let schedule = DigestSchedule {
            account_id: "acct-1".into(),
            cron_expression: "0 0 9 * * *".into(),
            last_occurrence: Some(sent_at),
            next_occurrence: None,
        };
        db.finalize_digests_sent(&[digest.id], sent_at, Some(&schedule))
            .await
            .unwrap();

        let loaded = db.get_digest(digest.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, DigestStatus::Sent);
        assert!(loaded.sent_at.is_some());

        let items = db.list_digest_items(&[digest.id]).await.unwrap();
        assert_eq!(items[0].content, REDACTED_CONTENT);

        let stored_schedule = db.get_digest_schedule("acct-1").await.unwrap().unwrap();
        assert!(stored_schedule.last_occurrence.is_some());
    }

    #[tokio::test]
    async fn failed_digests_keep_content() {
        let db = backend().await;
        let digest = db.find_or_create_pending_digest("acct-1").await.unwrap();
        db.upsert_digest_item(DigestItemUpsert {
            digest_id: digest.id,
            message_id: "m1",
            thread_id: "t1",
            rule_name: "Newsletters",
            content: "{\"summary\":\"keep me\"}",
            rule_execution_id: None,
            cold_email_id: None,
        })
        .await
        .unwrap();
        db.claim_pending_digests("acct-1").await.unwrap();
        db.mark_digests_failed(&[digest.id]).await.unwrap();

        let loaded = db.get_digest(digest.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, DigestStatus::Failed);
        let items = db.list_digest_items(&[digest.id]).await.unwrap();
        assert_eq!(items[0].content, "{\"summary\":\"keep me\"}");
    }

    #[tokio::test]
    async fn file_backed_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mailflow.db");
        let action_id;
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            let action = pending_action(Utc::now());
            action_id = action.id;
            db.insert_scheduled_action(&action).await.unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        let loaded = db.get_scheduled_action(action_id).await.unwrap();
        assert!(loaded.is_some());
    }
}

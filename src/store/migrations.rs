//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::StoreError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL,
                assistant_email TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS scheduled_actions (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                rule_execution_id TEXT,
                message_id TEXT NOT NULL,
                thread_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL DEFAULT 'pending',
                scheduled_for TEXT NOT NULL,
                executed_at TEXT,
                result_id TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_scheduled_actions_status
                ON scheduled_actions(status);
            CREATE INDEX IF NOT EXISTS idx_scheduled_actions_due
                ON scheduled_actions(status, scheduled_for);
            CREATE INDEX IF NOT EXISTS idx_scheduled_actions_account
                ON scheduled_actions(account_id);

            CREATE TABLE IF NOT EXISTS bulk_jobs (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                start_date TEXT NOT NULL,
                end_date TEXT,
                only_unread INTEGER NOT NULL DEFAULT 0,
                force_reprocess INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'running',
                pages_fetched INTEGER NOT NULL DEFAULT 0,
                total_discovered INTEGER NOT NULL DEFAULT 0,
                total_queued INTEGER NOT NULL DEFAULT 0,
                processed_count INTEGER NOT NULL DEFAULT 0,
                failed_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_bulk_jobs_account ON bulk_jobs(account_id);
            CREATE INDEX IF NOT EXISTS idx_bulk_jobs_status ON bulk_jobs(status);

            CREATE TABLE IF NOT EXISTS rule_executions (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                thread_id TEXT NOT NULL,
                rule_name TEXT NOT NULL,
                executed_at TEXT NOT NULL,
                UNIQUE (account_id, message_id)
            );
            CREATE INDEX IF NOT EXISTS idx_rule_executions_lookup
                ON rule_executions(account_id, message_id);

            CREATE TABLE IF NOT EXISTS digests (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                sent_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_digests_account_status
                ON digests(account_id, status);

            CREATE TABLE IF NOT EXISTS digest_items (
                id TEXT PRIMARY KEY,
                digest_id TEXT NOT NULL REFERENCES digests(id),
                message_id TEXT NOT NULL,
                thread_id TEXT NOT NULL,
                rule_name TEXT NOT NULL,
                content TEXT NOT NULL,
                rule_execution_id TEXT,
                cold_email_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (digest_id, message_id, thread_id)
            );
            CREATE INDEX IF NOT EXISTS idx_digest_items_digest
                ON digest_items(digest_id);
        "#,
    },
    Migration {
        version: 2,
        name: "digest_schedules",
        sql: r#"
            CREATE TABLE IF NOT EXISTS digest_schedules (
                account_id TEXT PRIMARY KEY,
                cron_expression TEXT NOT NULL,
                last_occurrence TEXT,
                next_occurrence TEXT
            );
        "#,
    },
    Migration {
        version: 3,
        name: "action_queue_tracing",
        sql: r#"
            ALTER TABLE scheduled_actions ADD COLUMN external_job_id TEXT;
            ALTER TABLE scheduled_actions ADD COLUMN scheduling_status TEXT;
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| StoreError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                StoreError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, StoreError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| StoreError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| StoreError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                StoreError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| StoreError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

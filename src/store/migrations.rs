//! Version-tracked database migrations for the libSQL databases.
//!
//! Each database file (tasks, jobs, notification queue) owns an ordered list
//! of migrations. `run_migrations()` checks the current version recorded in
//! `_migrations` and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

/// Task store schema. Add new versions to the end.
pub static TASK_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "tasks_and_subscriptions",
        sql: r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                flow_id TEXT NOT NULL,
                author_id TEXT NOT NULL,
                assignee_id TEXT NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                category TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'pending',
                cron_expression TEXT,
                result TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_flow ON tasks(flow_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

            CREATE TABLE IF NOT EXISTS subscriptions (
                id TEXT PRIMARY KEY,
                flow_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                category TEXT,
                state TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_subscriptions_flow ON subscriptions(flow_id, event_type);
            CREATE INDEX IF NOT EXISTS idx_subscriptions_event ON subscriptions(event_type);
        "#,
    },
];

/// Job store schema.
pub static JOB_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "scheduled_jobs",
    sql: r#"
        CREATE TABLE IF NOT EXISTS scheduled_jobs (
            id TEXT PRIMARY KEY,
            callback TEXT NOT NULL,
            args TEXT NOT NULL DEFAULT '[]',
            trigger_type TEXT NOT NULL,
            cron_expression TEXT,
            next_run_at TEXT NOT NULL,
            revision INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_scheduled_jobs_next_run ON scheduled_jobs(next_run_at);
    "#,
}];

/// Notification queue schema.
pub static QUEUE_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "notification_queue",
    sql: r#"
        CREATE TABLE IF NOT EXISTS queue_entries (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            payload TEXT NOT NULL,
            enqueued_at TEXT NOT NULL
        );
    "#,
}];

/// Run all pending migrations from `migrations` against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(
    conn: &Connection,
    migrations: &[Migration],
) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in migrations {
        if migration.version <= current_version {
            continue;
        }

        conn.execute_batch(migration.sql).await.map_err(|e| {
            DatabaseError::Migration(format!(
                "V{} ({}) failed: {e}",
                migration.version, migration.name
            ))
        })?;

        seed_version(conn, migration.version, migration.name).await?;
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applied migration"
        );
    }

    Ok(())
}

/// Highest applied migration version, 0 for a fresh database.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to read migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => Ok(row.get::<i64>(0).unwrap_or(0)),
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

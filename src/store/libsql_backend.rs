//! libSQL implementation of the `Database` trait.
//!
//! Supports local file and in-memory databases. A single connection is
//! shared behind an async mutex; holding the guard is the session, and a
//! transaction opened on it is committed explicitly or rolled back on drop.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::SqliteTarget;
use crate::error::DatabaseError;
use crate::store::migrations::{self, TASK_MIGRATIONS};
use crate::store::traits::{Database, TaskWrite};
use crate::tasks::model::{
    EventType, Subscription, SubscriptionFilter, Task, TaskStatus, TaskUpdate,
};

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Mutex<Connection>,
}

impl LibSqlBackend {
    /// Open (or create) the database behind `target` and run migrations.
    pub async fn open(target: &SqliteTarget) -> Result<Self, DatabaseError> {
        let (db, conn) = connect(target).await?;
        let backend = Self {
            db: Arc::new(db),
            conn: Mutex::new(conn),
        };
        backend.run_migrations().await?;
        if let SqliteTarget::File(path) = target {
            info!(path = %path.display(), "Task database opened");
        }
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        Self::open(&SqliteTarget::Memory).await
    }

    /// Acquire the session.
    async fn session(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Open a libSQL database and its connection, creating parent directories.
pub(crate) async fn connect(
    target: &SqliteTarget,
) -> Result<(LibSqlDatabase, Connection), DatabaseError> {
    let db = match target {
        SqliteTarget::Memory => libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?,
        SqliteTarget::File(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::Pool(format!("Failed to create database directory: {e}"))
                })?;
            }
            libsql::Builder::new_local(path)
                .build()
                .await
                .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?
        }
    };

    let conn = db
        .connect()
        .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
    Ok((db, conn))
}

/// Canonical timestamp format. Fixed width keeps text comparison ordered.
pub(crate) fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(ndt.and_utc());
    }
    Err(DatabaseError::Serialization(format!("invalid timestamp: {s:?}")))
}

/// Convert `Option<&str>` to libsql Value.
pub(crate) fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let id_str: String = row.get(0).map_err(|e| DatabaseError::Query(format!("task.id: {e}")))?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("task.id parse: {e}")))?;

    let text = |idx: i32, name: &str| -> Result<String, DatabaseError> {
        row.get::<String>(idx)
            .map_err(|e| DatabaseError::Query(format!("task.{name}: {e}")))
    };

    let status_str = text(8, "status")?;
    let status: TaskStatus = status_str
        .parse()
        .map_err(|e: String| DatabaseError::Serialization(format!("task {id}: {e}")))?;

    let cron_expression: Option<String> = row.get(9).ok();
    let result_str: Option<String> = row.get(10).ok();
    let result = match result_str.filter(|s| !s.is_empty()) {
        Some(s) => Some(serde_json::from_str(&s).map_err(|e| {
            DatabaseError::Serialization(format!("task {id} result: {e}"))
        })?),
        None => None,
    };

    Ok(Task {
        id,
        flow_id: text(1, "flow_id")?,
        author_id: text(2, "author_id")?,
        assignee_id: text(3, "assignee_id")?,
        title: row.get(4).unwrap_or_default(),
        description: row.get(5).unwrap_or_default(),
        category: text(6, "category")?,
        state: row.get(7).unwrap_or_default(),
        status,
        cron_expression: cron_expression.filter(|s| !s.is_empty()),
        result,
        created_at: parse_datetime(&text(11, "created_at")?)?,
        updated_at: parse_datetime(&text(12, "updated_at")?)?,
    })
}

fn row_to_subscription(row: &libsql::Row) -> Result<Subscription, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("subscription.id: {e}")))?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("subscription.id parse: {e}")))?;
    let flow_id: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("subscription.flow_id: {e}")))?;
    let event_str: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("subscription.event_type: {e}")))?;
    let event_type: EventType = event_str
        .parse()
        .map_err(|e: String| DatabaseError::Serialization(format!("subscription {id}: {e}")))?;
    let created_str: String = row
        .get(5)
        .map_err(|e| DatabaseError::Query(format!("subscription.created_at: {e}")))?;

    Ok(Subscription {
        id,
        flow_id,
        event_type,
        category: row.get(3).ok(),
        state: row.get(4).ok(),
        created_at: parse_datetime(&created_str)?,
    })
}

fn result_json(task: &Task) -> Result<Option<String>, DatabaseError> {
    task.result
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| DatabaseError::Serialization(e.to_string()))
}

async fn collect_subscriptions(
    mut rows: libsql::Rows,
    op: &str,
) -> Result<Vec<Subscription>, DatabaseError> {
    let mut subscriptions = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("{op} row: {e}")))?
    {
        subscriptions.push(row_to_subscription(&row)?);
    }
    Ok(subscriptions)
}

// ── Trait implementation ────────────────────────────────────────────

const TASK_COLUMNS: &str = "id, flow_id, author_id, assignee_id, title, description, category, state, status, cron_expression, result, created_at, updated_at";

const SUBSCRIPTION_COLUMNS: &str = "id, flow_id, event_type, category, state, created_at";

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let conn = self.session().await;
        migrations::run_migrations(&conn, TASK_MIGRATIONS).await
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError> {
        let conn = self.session().await;
        let result = result_json(task)?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_task begin: {e}")))?;

        tx.execute(
            &format!(
                "INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                task.id.to_string(),
                task.flow_id.as_str(),
                task.author_id.as_str(),
                task.assignee_id.as_str(),
                task.title.as_str(),
                task.description.as_str(),
                task.category.as_str(),
                task.state.as_str(),
                task.status.as_str(),
                opt_text(task.cron_expression.as_deref()),
                opt_text(result.as_deref()),
                format_datetime(task.created_at),
                format_datetime(task.updated_at),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("insert_task: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_task commit: {e}")))?;
        debug!(task_id = %task.id, "Task inserted");
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let conn = self.session().await;
        let mut rows = conn
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_task row: {e}"))),
        }
    }

    async fn list_tasks_for_flow(&self, flow_id: &str) -> Result<Vec<Task>, DatabaseError> {
        let conn = self.session().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE flow_id = ?1 ORDER BY created_at ASC, rowid ASC"
                ),
                params![flow_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks_for_flow: {e}")))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks_for_flow row: {e}")))?
        {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    async fn update_task(
        &self,
        id: Uuid,
        update: &TaskUpdate,
        expected_status: Option<TaskStatus>,
    ) -> Result<TaskWrite, DatabaseError> {
        let conn = self.session().await;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("update_task begin: {e}")))?;

        let mut rows = tx
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_task select: {e}")))?;
        let current = match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("update_task row: {e}")))?
        {
            Some(row) => row_to_task(&row)?,
            None => return Ok(TaskWrite::NotFound),
        };
        drop(rows);

        if let Some(expected) = expected_status
            && current.status != expected
        {
            return Ok(TaskWrite::StatusMismatch(current.status));
        }
        if update.is_empty() {
            return Ok(TaskWrite::Updated(current));
        }

        let mut task = current;
        update.apply_to(&mut task);
        let result = result_json(&task)?;

        tx.execute(
            "UPDATE tasks SET flow_id=?1, author_id=?2, assignee_id=?3, title=?4, description=?5, category=?6, state=?7, status=?8, cron_expression=?9, result=?10, updated_at=?11 WHERE id=?12",
            params![
                task.flow_id.as_str(),
                task.author_id.as_str(),
                task.assignee_id.as_str(),
                task.title.as_str(),
                task.description.as_str(),
                task.category.as_str(),
                task.state.as_str(),
                task.status.as_str(),
                opt_text(task.cron_expression.as_deref()),
                opt_text(result.as_deref()),
                format_datetime(task.updated_at),
                task.id.to_string(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("update_task: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("update_task commit: {e}")))?;
        debug!(task_id = %id, status = %task.status, "Task updated");
        Ok(TaskWrite::Updated(task))
    }

    async fn delete_task(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.session().await;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_task begin: {e}")))?;
        let count = tx
            .execute("DELETE FROM tasks WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_task: {e}")))?;
        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_task commit: {e}")))?;
        Ok(count > 0)
    }

    // ── Subscriptions ───────────────────────────────────────────────

    async fn insert_subscription(&self, subscription: &Subscription) -> Result<(), DatabaseError> {
        let conn = self.session().await;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_subscription begin: {e}")))?;
        tx.execute(
            &format!(
                "INSERT INTO subscriptions ({SUBSCRIPTION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
            ),
            params![
                subscription.id.to_string(),
                subscription.flow_id.as_str(),
                subscription.event_type.as_str(),
                opt_text(subscription.category.as_deref()),
                opt_text(subscription.state.as_deref()),
                format_datetime(subscription.created_at),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("insert_subscription: {e}")))?;
        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_subscription commit: {e}")))?;
        debug!(flow_id = %subscription.flow_id, event = %subscription.event_type, "Subscription added");
        Ok(())
    }

    async fn delete_subscriptions(
        &self,
        filter: &SubscriptionFilter,
    ) -> Result<usize, DatabaseError> {
        let conn = self.session().await;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_subscriptions begin: {e}")))?;
        // NULL binds disable the optional filters.
        let count = tx
            .execute(
                "DELETE FROM subscriptions WHERE flow_id = ?1 AND event_type = ?2 \
                 AND (?3 IS NULL OR category = ?3) AND (?4 IS NULL OR state = ?4)",
                params![
                    filter.flow_id.as_str(),
                    filter.event_type.as_str(),
                    opt_text(filter.category.as_deref()),
                    opt_text(filter.state.as_deref()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_subscriptions: {e}")))?;
        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_subscriptions commit: {e}")))?;
        Ok(count as usize)
    }

    async fn matching_subscriptions(
        &self,
        event_type: EventType,
        category: &str,
        state: &str,
    ) -> Result<Vec<Subscription>, DatabaseError> {
        let conn = self.session().await;
        let rows = conn
            .query(
                &format!(
                    "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE event_type = ?1 \
                     AND (category IS NULL OR category = ?2) AND (state IS NULL OR state = ?3) \
                     ORDER BY created_at ASC, rowid ASC"
                ),
                params![event_type.as_str(), category, state],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("matching_subscriptions: {e}")))?;
        collect_subscriptions(rows, "matching_subscriptions").await
    }

    async fn list_subscriptions(&self, flow_id: &str) -> Result<Vec<Subscription>, DatabaseError> {
        let conn = self.session().await;
        let rows = conn
            .query(
                &format!(
                    "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE flow_id = ?1 \
                     ORDER BY created_at ASC, rowid ASC"
                ),
                params![flow_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_subscriptions: {e}")))?;
        collect_subscriptions(rows, "list_subscriptions").await
    }
}

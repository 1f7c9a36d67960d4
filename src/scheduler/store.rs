//! Persistent job store.
//!
//! Jobs live in their own libSQL file so they survive restarts. Every row
//! carries a `revision` that is bumped whenever the job is replaced; firing
//! a job claims it against the revision the scheduler read.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, params};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::{SqliteTarget, sqlite_target};
use crate::error::{DatabaseError, SchedulerError};
use crate::scheduler::job::{JobSpec, JobTrigger, ScheduledJob};
use crate::store::libsql_backend::{connect, format_datetime, opt_text, parse_datetime};
use crate::store::migrations::{self, JOB_MIGRATIONS};

/// Storage behind the scheduler.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert `spec`, or replace the job with the same id. Returns the stored job.
    async fn upsert(
        &self,
        spec: &JobSpec,
        next_run_at: DateTime<Utc>,
    ) -> Result<ScheduledJob, DatabaseError>;

    async fn get_job(&self, id: &str) -> Result<Option<ScheduledJob>, DatabaseError>;

    /// All jobs, soonest first.
    async fn list_jobs(&self) -> Result<Vec<ScheduledJob>, DatabaseError>;

    /// Returns whether a job was removed.
    async fn remove_job(&self, id: &str) -> Result<bool, DatabaseError>;

    /// Jobs whose next run is at or before `now`, soonest first.
    async fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, DatabaseError>;

    /// Earliest next run across all jobs.
    async fn next_run_time(&self) -> Result<Option<DateTime<Utc>>, DatabaseError>;

    /// Take ownership of one firing of `job`.
    ///
    /// `next` of `None` deletes the job, otherwise its next run is moved to
    /// `next`. Both only happen while the stored revision still matches;
    /// `false` means the job was replaced or removed in the meantime.
    async fn claim(
        &self,
        job: &ScheduledJob,
        next: Option<DateTime<Utc>>,
    ) -> Result<bool, DatabaseError>;
}

/// libSQL-backed job store.
pub struct LibSqlJobStore {
    #[allow(dead_code)]
    db: libsql::Database,
    conn: Mutex<Connection>,
}

impl LibSqlJobStore {
    /// Open the job store addressed by a database URL.
    ///
    /// Only `sqlite://` URLs are supported.
    pub async fn open(url: &str) -> Result<Self, SchedulerError> {
        let target = sqlite_target(url).map_err(|e| SchedulerError::UnsupportedStore {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let store = Self::open_target(&target).await?;
        info!(url = %url, "Job store opened");
        Ok(store)
    }

    /// In-memory job store (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        Self::open_target(&SqliteTarget::Memory).await
    }

    async fn open_target(target: &SqliteTarget) -> Result<Self, DatabaseError> {
        let (db, conn) = connect(target).await?;
        migrations::run_migrations(&conn, JOB_MIGRATIONS).await?;
        Ok(Self {
            db,
            conn: Mutex::new(conn),
        })
    }
}

const JOB_COLUMNS: &str =
    "id, callback, args, trigger_type, cron_expression, next_run_at, revision, created_at, updated_at";

fn row_to_job(row: &libsql::Row) -> Result<ScheduledJob, DatabaseError> {
    let text = |idx: i32, name: &str| -> Result<String, DatabaseError> {
        row.get::<String>(idx)
            .map_err(|e| DatabaseError::Query(format!("job.{name}: {e}")))
    };

    let id = text(0, "id")?;
    let args = serde_json::from_str(&text(2, "args")?)
        .map_err(|e| DatabaseError::Serialization(format!("job {id} args: {e}")))?;
    let trigger = JobTrigger::from_db(&text(3, "trigger_type")?, row.get(4).ok())
        .map_err(|e| DatabaseError::Serialization(format!("job {id}: {e}")))?;
    let revision: i64 = row
        .get(6)
        .map_err(|e| DatabaseError::Query(format!("job.revision: {e}")))?;

    Ok(ScheduledJob {
        callback: text(1, "callback")?,
        args,
        trigger,
        next_run_at: parse_datetime(&text(5, "next_run_at")?)?,
        revision,
        created_at: parse_datetime(&text(7, "created_at")?)?,
        updated_at: parse_datetime(&text(8, "updated_at")?)?,
        id,
    })
}

async fn collect_jobs(mut rows: libsql::Rows, op: &str) -> Result<Vec<ScheduledJob>, DatabaseError> {
    let mut jobs = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("{op} row: {e}")))?
    {
        jobs.push(row_to_job(&row)?);
    }
    Ok(jobs)
}

#[async_trait]
impl JobStore for LibSqlJobStore {
    async fn upsert(
        &self,
        spec: &JobSpec,
        next_run_at: DateTime<Utc>,
    ) -> Result<ScheduledJob, DatabaseError> {
        let conn = self.conn.lock().await;
        let args = serde_json::to_string(&spec.args)
            .map_err(|e| DatabaseError::Serialization(format!("job {} args: {e}", spec.id)))?;
        let now = Utc::now();

        let tx = conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_job begin: {e}")))?;

        let mut rows = tx
            .query(
                "SELECT revision, created_at FROM scheduled_jobs WHERE id = ?1",
                params![spec.id.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_job select: {e}")))?;
        let existing = match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_job row: {e}")))?
        {
            Some(row) => {
                let revision: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("job.revision: {e}")))?;
                let created: String = row
                    .get(1)
                    .map_err(|e| DatabaseError::Query(format!("job.created_at: {e}")))?;
                Some((revision, parse_datetime(&created)?))
            }
            None => None,
        };
        drop(rows);

        let (revision, created_at) = match existing {
            Some((revision, created_at)) => {
                tx.execute(
                    "UPDATE scheduled_jobs SET callback=?1, args=?2, trigger_type=?3, cron_expression=?4, \
                     next_run_at=?5, revision=?6, updated_at=?7 WHERE id=?8",
                    params![
                        spec.callback.as_str(),
                        args,
                        spec.trigger.type_tag(),
                        opt_text(spec.trigger.cron_expression()),
                        format_datetime(next_run_at),
                        revision + 1,
                        format_datetime(now),
                        spec.id.as_str(),
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("upsert_job update: {e}")))?;
                (revision + 1, created_at)
            }
            None => {
                tx.execute(
                    &format!(
                        "INSERT INTO scheduled_jobs ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?7)"
                    ),
                    params![
                        spec.id.as_str(),
                        spec.callback.as_str(),
                        args,
                        spec.trigger.type_tag(),
                        opt_text(spec.trigger.cron_expression()),
                        format_datetime(next_run_at),
                        format_datetime(now),
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("upsert_job insert: {e}")))?;
                (1, now)
            }
        };

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_job commit: {e}")))?;
        debug!(job_id = %spec.id, revision, "Job stored");

        Ok(ScheduledJob {
            id: spec.id.clone(),
            callback: spec.callback.clone(),
            args: spec.args.clone(),
            trigger: spec.trigger.clone(),
            next_run_at,
            revision,
            created_at,
            updated_at: now,
        })
    }

    async fn get_job(&self, id: &str) -> Result<Option<ScheduledJob>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM scheduled_jobs WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_job row: {e}"))),
        }
    }

    async fn list_jobs(&self) -> Result<Vec<ScheduledJob>, DatabaseError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM scheduled_jobs ORDER BY next_run_at ASC, id ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_jobs: {e}")))?;
        collect_jobs(rows, "list_jobs").await
    }

    async fn remove_job(&self, id: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn.lock().await;
        let count = conn
            .execute("DELETE FROM scheduled_jobs WHERE id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("remove_job: {e}")))?;
        Ok(count > 0)
    }

    async fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, DatabaseError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM scheduled_jobs WHERE next_run_at <= ?1 \
                     ORDER BY next_run_at ASC, id ASC"
                ),
                params![format_datetime(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("due_jobs: {e}")))?;
        collect_jobs(rows, "due_jobs").await
    }

    async fn next_run_time(&self) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query("SELECT MIN(next_run_at) FROM scheduled_jobs", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("next_run_time: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("next_run_time row: {e}")))?;
        row.and_then(|row| row.get::<String>(0).ok())
            .map(|s| parse_datetime(&s))
            .transpose()
    }

    async fn claim(
        &self,
        job: &ScheduledJob,
        next: Option<DateTime<Utc>>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn.lock().await;
        let count = match next {
            None => conn
                .execute(
                    "DELETE FROM scheduled_jobs WHERE id = ?1 AND revision = ?2",
                    params![job.id.as_str(), job.revision],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("claim_job delete: {e}")))?,
            Some(next) => conn
                .execute(
                    "UPDATE scheduled_jobs SET next_run_at = ?1, updated_at = ?2 \
                     WHERE id = ?3 AND revision = ?4",
                    params![
                        format_datetime(next),
                        format_datetime(Utc::now()),
                        job.id.as_str(),
                        job.revision,
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("claim_job advance: {e}")))?,
        };
        Ok(count > 0)
    }
}

//! Scheduler run loop.
//!
//! A single background task polls the job store, claims due jobs and hands
//! them to a [`JobHandler`] one at a time. It sleeps until the earliest next
//! run (capped by the poll interval) and wakes early when a job is scheduled
//! or the scheduler is stopped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::SchedulerError;
use crate::scheduler::job::{JobSpec, ScheduledJob};
use crate::scheduler::store::{JobStore, LibSqlJobStore};

/// Receives fired jobs.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run_job(&self, job: &ScheduledJob) -> crate::error::Result<()>;
}

struct Runner {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Persistent job scheduler.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    poll_interval: Duration,
    wakeup: Arc<Notify>,
    runner: Mutex<Option<Runner>>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn JobStore>, poll_interval: Duration) -> Self {
        Self {
            store,
            poll_interval,
            wakeup: Arc::new(Notify::new()),
            runner: Mutex::new(None),
        }
    }

    /// Open a scheduler over the libSQL job store at `url`.
    pub async fn open(url: &str, poll_interval: Duration) -> Result<Self, SchedulerError> {
        let store = LibSqlJobStore::open(url).await?;
        Ok(Self::new(Arc::new(store), poll_interval))
    }

    /// Start the run loop. No-op when already running.
    pub async fn start(&self, handler: Arc<dyn JobHandler>) {
        let mut runner = self.runner.lock().await;
        if runner.is_some() {
            debug!("Scheduler already running");
            return;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_loop(
            Arc::clone(&self.store),
            handler,
            Arc::clone(&self.wakeup),
            shutdown_rx,
            self.poll_interval,
        ));
        *runner = Some(Runner { shutdown, handle });
        info!(poll_ms = self.poll_interval.as_millis() as u64, "Scheduler started");
    }

    /// Stop the run loop, letting an in-flight job finish. No-op when stopped.
    pub async fn stop(&self) {
        let Some(runner) = self.runner.lock().await.take() else {
            return;
        };
        let _ = runner.shutdown.send(true);
        if let Err(e) = runner.handle.await {
            error!(error = %e, "Scheduler loop ended abnormally");
        }
        info!("Scheduler stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.runner.lock().await.is_some()
    }

    /// Register a job, replacing any job with the same id.
    pub async fn schedule(&self, spec: JobSpec) -> Result<ScheduledJob, SchedulerError> {
        let next_run_at = spec.trigger.first_run_at(Utc::now())?;
        let job = self.store.upsert(&spec, next_run_at).await?;
        self.wakeup.notify_one();
        info!(
            job_id = %job.id,
            trigger = job.trigger.type_tag(),
            next_run_at = %job.next_run_at,
            revision = job.revision,
            "Job scheduled"
        );
        Ok(job)
    }

    /// Returns whether the job existed.
    pub async fn remove_job(&self, id: &str) -> Result<bool, SchedulerError> {
        let removed = self.store.remove_job(id).await?;
        if removed {
            info!(job_id = %id, "Job removed");
        }
        Ok(removed)
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<ScheduledJob>, SchedulerError> {
        Ok(self.store.get_job(id).await?)
    }

    pub async fn list_jobs(&self) -> Result<Vec<ScheduledJob>, SchedulerError> {
        Ok(self.store.list_jobs().await?)
    }
}

async fn run_loop(
    store: Arc<dyn JobStore>,
    handler: Arc<dyn JobHandler>,
    wakeup: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
    poll_interval: Duration,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        run_due_jobs(store.as_ref(), handler.as_ref(), &shutdown).await;

        let sleep_for = match store.next_run_time().await {
            Ok(Some(next)) => (next - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(poll_interval),
            Ok(None) => poll_interval,
            Err(e) => {
                error!(error = %e, "Failed to read next run time");
                poll_interval
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = wakeup.notified() => {}
            _ = shutdown.changed() => break,
        }
    }
}

/// Fire every job due now, oldest first.
///
/// A cron job that missed several occurrences fires once and moves to its
/// first occurrence after now.
async fn run_due_jobs(
    store: &dyn JobStore,
    handler: &dyn JobHandler,
    shutdown: &watch::Receiver<bool>,
) {
    let now = Utc::now();
    let due = match store.due_jobs(now).await {
        Ok(due) => due,
        Err(e) => {
            error!(error = %e, "Failed to load due jobs");
            return;
        }
    };

    for job in due {
        if *shutdown.borrow() {
            break;
        }

        let next = match job.trigger.next_run_after(now) {
            Ok(next) => next,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Unreadable trigger, firing once and dropping");
                None
            }
        };

        match store.claim(&job, next).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(job_id = %job.id, revision = job.revision, "Job replaced before firing");
                continue;
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to claim job");
                continue;
            }
        }

        info!(job_id = %job.id, callback = %job.callback, "Job fired");
        if let Err(e) = handler.run_job(&job).await {
            warn!(job_id = %job.id, error = %e, "Job callback failed");
        }
    }
}

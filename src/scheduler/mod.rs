//! Persistent job scheduling. One-shot and cron jobs that survive restarts.

pub mod engine;
pub mod job;
pub mod store;

pub use engine::{JobHandler, Scheduler};
pub use job::{JobSpec, JobTrigger, ScheduledJob, next_cron_fire, parse_cron};
pub use store::{JobStore, LibSqlJobStore};

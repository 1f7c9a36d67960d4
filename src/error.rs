//! Error types for the task orchestrator.

use uuid::Uuid;

use crate::tasks::model::TaskStatus;

/// Top-level error type for the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Unsupported database URL: {0}")]
    UnsupportedUrl(String),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Job scheduler errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("Job store unavailable at {url}: {reason}")]
    UnsupportedStore { url: String, reason: String },

    #[error("Job {id} cannot run: {reason}")]
    InvalidJob { id: String, reason: String },

    #[error("Job store error: {0}")]
    Storage(#[from] DatabaseError),
}

/// Errors surfaced by task operations.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task with id {id} not found")]
    NotFound { id: Uuid },

    #[error("Task {id} is {status}, cannot transition to {target}")]
    InvalidState {
        id: Uuid,
        status: TaskStatus,
        target: TaskStatus,
    },

    #[error("Validation failed: {0}")]
    Validation(String),
}

/// Task processor failures. Recorded on the task, never returned to callers.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("No processor registered for category '{0}'")]
    NoProcessor(String),

    #[error("Processor panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Failed(String),
}

/// Result type alias for the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;

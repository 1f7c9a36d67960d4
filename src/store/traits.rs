//! Unified `Database` trait, the single async interface for task and
//! subscription persistence.
//!
//! Every mutation runs inside its own transaction: committed on success,
//! rolled back on every other exit path.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::tasks::model::{
    EventType, Subscription, SubscriptionFilter, Task, TaskStatus, TaskUpdate,
};

/// Outcome of a conditional task update.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskWrite {
    /// The row was rewritten; carries the stored task.
    Updated(Task),
    /// No task with that id.
    NotFound,
    /// The stored status differed from the expected one; nothing was written.
    StatusMismatch(TaskStatus),
}

/// Backend-agnostic database trait covering tasks and subscriptions.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a new task.
    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError>;

    /// Get a task by ID.
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// All tasks owned by a flow, oldest first.
    async fn list_tasks_for_flow(&self, flow_id: &str) -> Result<Vec<Task>, DatabaseError>;

    /// Read, merge `update` and write back in one transaction.
    ///
    /// With `expected_status` set, the write only happens when the stored
    /// status still equals it.
    async fn update_task(
        &self,
        id: Uuid,
        update: &TaskUpdate,
        expected_status: Option<TaskStatus>,
    ) -> Result<TaskWrite, DatabaseError>;

    /// Delete a task. Returns whether a row was removed.
    async fn delete_task(&self, id: Uuid) -> Result<bool, DatabaseError>;

    // ── Subscriptions ───────────────────────────────────────────────

    /// Insert a new subscription.
    async fn insert_subscription(&self, subscription: &Subscription) -> Result<(), DatabaseError>;

    /// Delete subscriptions selected by `filter`. Returns the number removed.
    async fn delete_subscriptions(&self, filter: &SubscriptionFilter)
    -> Result<usize, DatabaseError>;

    /// Subscriptions for `event_type` whose filters accept the category and
    /// state, oldest first.
    async fn matching_subscriptions(
        &self,
        event_type: EventType,
        category: &str,
        state: &str,
    ) -> Result<Vec<Subscription>, DatabaseError>;

    /// All subscriptions held by a flow.
    async fn list_subscriptions(&self, flow_id: &str) -> Result<Vec<Subscription>, DatabaseError>;
}

//! Task data model: tasks, subscriptions, notifications, and their enums.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TaskError;
use crate::scheduler::job::parse_cron;

/// Structural lifecycle stage of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, waiting for the scheduler.
    Pending,
    /// Claimed by `consume_task`, processor running.
    Processing,
    /// Processor returned a result.
    Completed,
    /// Processor failed; `result` carries the error.
    Failed,
}

impl TaskStatus {
    /// Completed and failed tasks never move again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Whether `self → next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Processing)
                | (TaskStatus::Processing, TaskStatus::Completed)
                | (TaskStatus::Processing, TaskStatus::Failed)
        )
    }

    /// The string tag stored in the DB status column.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Lifecycle events a flow can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TaskCreated,
    TaskUpdated,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::TaskCreated => "task_created",
            EventType::TaskUpdated => "task_updated",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task_created" => Ok(EventType::TaskCreated),
            "task_updated" => Ok(EventType::TaskUpdated),
            other => Err(format!("unknown event type: {other}")),
        }
    }
}

/// A persisted unit of schedulable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    /// Owning flow.
    pub flow_id: String,
    /// Flow that created the task. Always notified.
    pub author_id: String,
    /// Flow expected to act on the task. Always notified.
    pub assignee_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Selects the processor.
    pub category: String,
    /// Business-defined workflow stage, independent of `status`.
    pub state: String,
    pub status: TaskStatus,
    /// Recurring schedule; `None` runs once, as soon as possible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Build a pending task from a validated create request.
    pub fn from_create(create: TaskCreate) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            flow_id: create.flow_id,
            author_id: create.author_id,
            assignee_id: create.assignee_id,
            title: create.title,
            description: create.description,
            category: create.category,
            state: create.state,
            status: TaskStatus::Pending,
            cron_expression: create.cron_expression,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Input to `create_task`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskCreate {
    pub flow_id: String,
    pub author_id: String,
    pub assignee_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub category: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub cron_expression: Option<String>,
}

impl TaskCreate {
    pub fn new(
        flow_id: impl Into<String>,
        author_id: impl Into<String>,
        assignee_id: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            flow_id: flow_id.into(),
            author_id: author_id.into(),
            assignee_id: assignee_id.into(),
            category: category.into(),
            ..Default::default()
        }
    }

    /// Builder: set title.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Builder: set workflow state.
    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = state.into();
        self
    }

    /// Builder: make the task recurring.
    pub fn with_cron(mut self, expression: impl Into<String>) -> Self {
        self.cron_expression = Some(expression.into());
        self
    }

    pub fn validate(&self) -> Result<(), TaskError> {
        require_identifier("flow_id", &self.flow_id)?;
        require_identifier("author_id", &self.author_id)?;
        require_identifier("assignee_id", &self.assignee_id)?;
        require_identifier("category", &self.category)?;
        if let Some(expr) = &self.cron_expression {
            validate_cron(expr)?;
        }
        Ok(())
    }
}

/// Partial update. `None` fields are left untouched.
///
/// `cron_expression` and `result` are nullable: `Some(None)` clears them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub cron_expression: Option<Option<String>>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Option<serde_json::Value>>,
}

/// A field present in the input, `null` included, is `Some`.
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl TaskUpdate {
    /// An update that only moves the status.
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Builder: set result payload.
    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(Some(result));
        self
    }

    /// Builder: set or clear the recurring schedule.
    pub fn with_cron(mut self, expression: Option<String>) -> Self {
        self.cron_expression = Some(expression);
        self
    }

    /// Builder: clear the result payload.
    pub fn clear_result(mut self) -> Self {
        self.result = Some(None);
        self
    }

    /// Builder: set workflow state.
    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn validate(&self) -> Result<(), TaskError> {
        let identifiers = [
            ("flow_id", &self.flow_id),
            ("author_id", &self.author_id),
            ("assignee_id", &self.assignee_id),
            ("category", &self.category),
        ];
        for (field, value) in identifiers {
            if let Some(v) = value {
                require_identifier(field, v)?;
            }
        }
        if let Some(Some(expr)) = &self.cron_expression {
            validate_cron(expr)?;
        }
        Ok(())
    }

    /// Copy every present field onto `task` and bump `updated_at`.
    /// An empty update leaves the task untouched.
    pub fn apply_to(&self, task: &mut Task) {
        if self.is_empty() {
            return;
        }
        if let Some(v) = &self.flow_id {
            task.flow_id = v.clone();
        }
        if let Some(v) = &self.author_id {
            task.author_id = v.clone();
        }
        if let Some(v) = &self.assignee_id {
            task.assignee_id = v.clone();
        }
        if let Some(v) = &self.title {
            task.title = v.clone();
        }
        if let Some(v) = &self.description {
            task.description = v.clone();
        }
        if let Some(v) = &self.category {
            task.category = v.clone();
        }
        if let Some(v) = &self.state {
            task.state = v.clone();
        }
        if let Some(v) = self.status {
            task.status = v;
        }
        if let Some(v) = &self.cron_expression {
            task.cron_expression = v.clone();
        }
        if let Some(v) = &self.result {
            task.result = v.clone();
        }
        task.updated_at = Utc::now();
    }
}

/// Standing interest of a flow in task lifecycle events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    /// Notification target.
    pub flow_id: String,
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    pub fn new(
        flow_id: impl Into<String>,
        event_type: EventType,
        category: Option<String>,
        state: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            flow_id: flow_id.into(),
            event_type,
            category,
            state,
            created_at: Utc::now(),
        }
    }

    /// The target flow must be a usable identifier; set filters must not be blank.
    pub fn validate(&self) -> Result<(), TaskError> {
        require_identifier("flow_id", &self.flow_id)?;
        if let Some(category) = &self.category {
            require_identifier("category", category)?;
        }
        if let Some(state) = &self.state {
            require_identifier("state", state)?;
        }
        Ok(())
    }
}

/// Selects the subscriptions removed by `unsubscribe_flow`.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionFilter {
    pub flow_id: String,
    pub event_type: EventType,
    /// Narrow to this category when set.
    pub category: Option<String>,
    /// Narrow to this state when set.
    pub state: Option<String>,
}

/// Snapshot of a task event addressed to one flow.
///
/// Serializes as a flat record of strings. Later changes to the task never
/// alter a notification already queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskNotification {
    pub task_id: Uuid,
    pub flow_id: String,
    pub event_type: EventType,
    pub category: String,
    pub state: String,
    pub status: TaskStatus,
}

impl TaskNotification {
    /// Snapshot `task` for `recipient`. Fails on a blank recipient.
    pub fn snapshot(
        task: &Task,
        recipient: &str,
        event_type: EventType,
    ) -> Result<Self, TaskError> {
        require_identifier("flow_id", recipient)?;
        Ok(Self {
            task_id: task.id,
            flow_id: recipient.to_string(),
            event_type,
            category: task.category.clone(),
            state: task.state.clone(),
            status: task.status,
        })
    }
}

fn require_identifier(field: &str, value: &str) -> Result<(), TaskError> {
    if value.trim().is_empty() {
        return Err(TaskError::Validation(format!("{field} must not be blank")));
    }
    if value.chars().any(char::is_control) {
        return Err(TaskError::Validation(format!(
            "{field} contains control characters"
        )));
    }
    Ok(())
}

fn validate_cron(expression: &str) -> Result<(), TaskError> {
    parse_cron(expression)
        .map(|_| ())
        .map_err(|e| TaskError::Validation(e.to_string()))
}

//! Task orchestration service.
//!
//! Owns the task store, the job scheduler and the notification queue. Every
//! lifecycle change is persisted first, then fanned out to the task's author,
//! its assignee and every matching subscriber.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{Error, ProcessError, Result, SchedulerError, TaskError};
use crate::orchestrator::processor::ProcessorRegistry;
use crate::queue::DurableQueue;
use crate::scheduler::{JobHandler, JobSpec, JobTrigger, ScheduledJob, Scheduler};
use crate::store::{Database, TaskWrite};
use crate::tasks::model::{
    EventType, Subscription, SubscriptionFilter, Task, TaskCreate, TaskNotification, TaskStatus,
    TaskUpdate,
};

/// Callback name stored on every task job.
pub const CONSUME_TASK_CALLBACK: &str = "consume_task";

pub struct TaskOrchestrator {
    db: Arc<dyn Database>,
    scheduler: Scheduler,
    queue: DurableQueue,
    processors: ProcessorRegistry,
}

impl TaskOrchestrator {
    pub fn new(
        db: Arc<dyn Database>,
        scheduler: Scheduler,
        queue: DurableQueue,
        processors: ProcessorRegistry,
    ) -> Self {
        Self {
            db,
            scheduler,
            queue,
            processors,
        }
    }

    /// Open the job store and notification queue described by `config`.
    ///
    /// The scheduler is not started; call [`TaskOrchestrator::start`].
    pub async fn open(
        config: &OrchestratorConfig,
        db: Arc<dyn Database>,
        processors: ProcessorRegistry,
    ) -> Result<Arc<Self>> {
        let scheduler = Scheduler::open(&config.jobs_database_url(), config.poll_interval).await?;
        let queue = DurableQueue::open(&config.notifications_path()).await?;
        info!(
            jobs_url = %config.jobs_database_url(),
            cache_dir = %config.cache_dir().display(),
            "Task orchestrator ready"
        );
        Ok(Arc::new(Self::new(db, scheduler, queue, processors)))
    }

    /// Start the scheduler with this service as its job handler.
    pub async fn start(self: &Arc<Self>) {
        let handler = Arc::new(ConsumeTaskHandler {
            orchestrator: Arc::downgrade(self),
        });
        self.scheduler.start(handler).await;
    }

    /// Stop the scheduler. A task being consumed finishes first.
    pub async fn stop(&self) {
        self.scheduler.stop().await;
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    // ── Tasks ───────────────────────────────────────────────────────

    /// Persist a new pending task, announce it and schedule its job.
    pub async fn create_task(&self, create: TaskCreate) -> Result<Task> {
        create.validate()?;
        let task = Task::from_create(create);
        self.db.insert_task(&task).await?;
        info!(task_id = %task.id, flow_id = %task.flow_id, category = %task.category, "Task created");

        self.notify(&task, EventType::TaskCreated).await?;
        self.schedule_task(&task).await?;
        Ok(task)
    }

    /// Apply the present fields of `update`. Never reschedules.
    pub async fn update_task(&self, id: Uuid, update: TaskUpdate) -> Result<Task> {
        update.validate()?;

        let expected = match update.status {
            Some(target) => {
                let current = self.get_task(id).await?;
                if current.status != target && !current.status.can_transition_to(target) {
                    return Err(TaskError::InvalidState {
                        id,
                        status: current.status,
                        target,
                    }
                    .into());
                }
                Some(current.status)
            }
            None => None,
        };

        let task = self.write(id, &update, expected).await?;
        debug!(task_id = %id, "Task updated");
        self.notify(&task, EventType::TaskUpdated).await?;
        Ok(task)
    }

    pub async fn get_task(&self, id: Uuid) -> Result<Task> {
        self.db
            .get_task(id)
            .await?
            .ok_or_else(|| TaskError::NotFound { id }.into())
    }

    pub async fn get_tasks_for_flow(&self, flow_id: &str) -> Result<Vec<Task>> {
        Ok(self.db.list_tasks_for_flow(flow_id).await?)
    }

    /// Delete the task and cancel its job.
    pub async fn delete_task(&self, id: Uuid) -> Result<()> {
        if !self.db.delete_task(id).await? {
            return Err(TaskError::NotFound { id }.into());
        }
        self.scheduler.remove_job(&id.to_string()).await?;
        info!(task_id = %id, "Task deleted");
        Ok(())
    }

    /// (Re)register the task's job: recurring for cron tasks, otherwise a
    /// single immediate run. Replaces any job already held by the task.
    pub async fn schedule_task(&self, task: &Task) -> Result<ScheduledJob> {
        let trigger = match &task.cron_expression {
            Some(expression) => JobTrigger::Cron {
                expression: expression.clone(),
            },
            None => JobTrigger::Immediate,
        };
        let spec = JobSpec {
            id: task.id.to_string(),
            callback: CONSUME_TASK_CALLBACK.to_string(),
            args: json!([task.id.to_string()]),
            trigger,
        };
        Ok(self.scheduler.schedule(spec).await?)
    }

    /// Run the task's processor, moving it pending → processing → completed
    /// or failed. Processor failures end in `failed` and are not returned.
    pub async fn consume_task(&self, id: Uuid) -> Result<Task> {
        let task = self.get_task(id).await?;
        if task.status != TaskStatus::Pending {
            return Err(TaskError::InvalidState {
                id,
                status: task.status,
                target: TaskStatus::Processing,
            }
            .into());
        }

        let processing = self
            .write(
                id,
                &TaskUpdate::status(TaskStatus::Processing),
                Some(TaskStatus::Pending),
            )
            .await?;
        info!(task_id = %id, category = %processing.category, "Processing task");
        self.notify(&processing, EventType::TaskUpdated).await?;

        let outcome = match self.run_processor(&processing).await {
            Ok(result) => TaskUpdate::status(TaskStatus::Completed).with_result(result),
            Err(e) => {
                warn!(task_id = %id, error = %e, "Task processing failed");
                TaskUpdate::status(TaskStatus::Failed).with_result(json!({"error": e.to_string()}))
            }
        };

        let finished = self
            .write(id, &outcome, Some(TaskStatus::Processing))
            .await?;
        info!(task_id = %id, status = %finished.status, "Task finished");
        self.notify(&finished, EventType::TaskUpdated).await?;
        Ok(finished)
    }

    // ── Subscriptions ───────────────────────────────────────────────

    pub async fn subscribe_flow(
        &self,
        flow_id: &str,
        event_type: EventType,
        category: Option<String>,
        state: Option<String>,
    ) -> Result<Subscription> {
        let subscription = Subscription::new(flow_id, event_type, category, state);
        subscription.validate()?;
        self.db.insert_subscription(&subscription).await?;
        info!(flow_id = %flow_id, event = %event_type, "Flow subscribed");
        Ok(subscription)
    }

    /// Remove the flow's subscriptions to `event_type`, narrowed by the
    /// filters given. Returns how many were removed.
    pub async fn unsubscribe_flow(
        &self,
        flow_id: &str,
        event_type: EventType,
        category: Option<String>,
        state: Option<String>,
    ) -> Result<usize> {
        let filter = SubscriptionFilter {
            flow_id: flow_id.to_string(),
            event_type,
            category,
            state,
        };
        let removed = self.db.delete_subscriptions(&filter).await?;
        info!(flow_id = %flow_id, event = %event_type, removed, "Flow unsubscribed");
        Ok(removed)
    }

    pub async fn get_subscriptions(&self, flow_id: &str) -> Result<Vec<Subscription>> {
        Ok(self.db.list_subscriptions(flow_id).await?)
    }

    // ── Notifications ───────────────────────────────────────────────

    /// Drain every queued notification, oldest first.
    pub async fn get_notifications(&self) -> Result<Vec<TaskNotification>> {
        Ok(self.queue.drain().await?)
    }

    /// Queue one snapshot of `task` per recipient: author, assignee, then
    /// each matching subscriber. Recipients are not deduplicated.
    async fn notify(&self, task: &Task, event_type: EventType) -> Result<()> {
        let subscribers = self
            .db
            .matching_subscriptions(event_type, &task.category, &task.state)
            .await?;

        let recipients = [task.author_id.as_str(), task.assignee_id.as_str()]
            .into_iter()
            .chain(subscribers.iter().map(|s| s.flow_id.as_str()));
        let notifications = recipients
            .map(|recipient| TaskNotification::snapshot(task, recipient, event_type))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        self.queue.push_all(&notifications).await?;
        debug!(task_id = %task.id, event = %event_type, count = notifications.len(), "Notifications queued");
        Ok(())
    }

    // ── Helpers ─────────────────────────────────────────────────────

    async fn write(
        &self,
        id: Uuid,
        update: &TaskUpdate,
        expected: Option<TaskStatus>,
    ) -> Result<Task> {
        match self.db.update_task(id, update, expected).await? {
            TaskWrite::Updated(task) => Ok(task),
            TaskWrite::NotFound => Err(TaskError::NotFound { id }.into()),
            TaskWrite::StatusMismatch(status) => Err(TaskError::InvalidState {
                id,
                status,
                target: update.status.unwrap_or(status),
            }
            .into()),
        }
    }

    /// Run the category's processor on its own task so a panic becomes a
    /// failure instead of taking down the scheduler loop.
    async fn run_processor(&self, task: &Task) -> std::result::Result<serde_json::Value, ProcessError> {
        let processor = self
            .processors
            .get(&task.category)
            .ok_or_else(|| ProcessError::NoProcessor(task.category.clone()))?;

        let task = task.clone();
        match tokio::spawn(async move { processor.process(&task).await }).await {
            Ok(outcome) => outcome,
            Err(e) => Err(ProcessError::Panicked(e.to_string())),
        }
    }
}

/// Routes fired jobs back to the service without keeping it alive.
struct ConsumeTaskHandler {
    orchestrator: Weak<TaskOrchestrator>,
}

#[async_trait]
impl JobHandler for ConsumeTaskHandler {
    async fn run_job(&self, job: &ScheduledJob) -> Result<()> {
        let Some(orchestrator) = self.orchestrator.upgrade() else {
            return Ok(());
        };
        if job.callback != CONSUME_TASK_CALLBACK {
            return Err(invalid_job(job, format!("unknown callback '{}'", job.callback)));
        }
        let task_id = job
            .args
            .get(0)
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| invalid_job(job, "expected a task id argument".to_string()))?;

        orchestrator.consume_task(task_id).await?;
        Ok(())
    }
}

fn invalid_job(job: &ScheduledJob, reason: String) -> Error {
    SchedulerError::InvalidJob {
        id: job.id.clone(),
        reason,
    }
    .into()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::orchestrator::processor::TaskProcessor;
    use crate::scheduler::LibSqlJobStore;
    use crate::store::LibSqlBackend;

    struct Exploding;

    #[async_trait]
    impl TaskProcessor for Exploding {
        async fn process(&self, _task: &Task) -> std::result::Result<serde_json::Value, ProcessError> {
            Err(ProcessError::Failed("smtp unreachable".into()))
        }
    }

    struct Panicking;

    #[async_trait]
    impl TaskProcessor for Panicking {
        async fn process(&self, _task: &Task) -> std::result::Result<serde_json::Value, ProcessError> {
            panic!("processor bug");
        }
    }

    async fn test_orchestrator(processors: ProcessorRegistry) -> TaskOrchestrator {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let jobs = Arc::new(LibSqlJobStore::new_memory().await.unwrap());
        let scheduler = Scheduler::new(jobs, Duration::from_millis(20));
        let queue = DurableQueue::new_memory().await.unwrap();
        TaskOrchestrator::new(db, scheduler, queue, processors)
    }

    fn email_task() -> TaskCreate {
        TaskCreate::new("flow-1", "author-1", "assignee-1", "email")
            .with_title("Send digest")
            .with_state("draft")
    }

    #[tokio::test]
    async fn create_persists_notifies_and_schedules() {
        let orch = test_orchestrator(ProcessorRegistry::default()).await;
        let task = orch.create_task(email_task()).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);

        let notes = orch.get_notifications().await.unwrap();
        let recipients: Vec<&str> = notes.iter().map(|n| n.flow_id.as_str()).collect();
        assert_eq!(recipients, vec!["author-1", "assignee-1"]);
        assert!(notes.iter().all(|n| n.event_type == EventType::TaskCreated));

        let job = orch
            .scheduler()
            .get_job(&task.id.to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.trigger, JobTrigger::Immediate);
        assert_eq!(job.callback, CONSUME_TASK_CALLBACK);
        assert_eq!(job.args, json!([task.id.to_string()]));
    }

    #[tokio::test]
    async fn create_rejects_invalid_input_without_side_effects() {
        let orch = test_orchestrator(ProcessorRegistry::default()).await;
        let result = orch
            .create_task(TaskCreate::new("flow-1", "", "assignee-1", "email"))
            .await;
        assert!(matches!(result, Err(Error::Task(TaskError::Validation(_)))));
        assert!(orch.get_tasks_for_flow("flow-1").await.unwrap().is_empty());
        assert!(orch.get_notifications().await.unwrap().is_empty());
        assert!(orch.scheduler().list_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cron_task_gets_recurring_job() {
        let orch = test_orchestrator(ProcessorRegistry::default()).await;
        let task = orch
            .create_task(email_task().with_cron("0 * * * *"))
            .await
            .unwrap();

        let job = orch
            .scheduler()
            .get_job(&task.id.to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.trigger.cron_expression(), Some("0 * * * *"));

        // Rescheduling replaces rather than duplicates
        let again = orch.schedule_task(&task).await.unwrap();
        assert_eq!(again.revision, job.revision + 1);
        assert_eq!(orch.scheduler().list_jobs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn consume_completes_with_default_result() {
        let orch = test_orchestrator(ProcessorRegistry::default()).await;
        let task = orch.create_task(email_task()).await.unwrap();
        orch.get_notifications().await.unwrap();

        let done = orch.consume_task(task.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(
            done.result,
            Some(json!({"result": "Task processed successfully"}))
        );

        let notes = orch.get_notifications().await.unwrap();
        let statuses: Vec<TaskStatus> = notes.iter().map(|n| n.status).collect();
        assert_eq!(
            statuses,
            vec![
                TaskStatus::Processing,
                TaskStatus::Processing,
                TaskStatus::Completed,
                TaskStatus::Completed,
            ]
        );
        assert!(notes.iter().all(|n| n.event_type == EventType::TaskUpdated));
    }

    #[tokio::test]
    async fn failing_processor_marks_task_failed() {
        let registry = ProcessorRegistry::default().with("email", Arc::new(Exploding));
        let orch = test_orchestrator(registry).await;
        let task = orch.create_task(email_task()).await.unwrap();
        orch.get_notifications().await.unwrap();

        let done = orch.consume_task(task.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.result, Some(json!({"error": "smtp unreachable"})));
        assert_eq!(orch.get_task(task.id).await.unwrap(), done);

        // One entry per recipient for each transition
        let notes = orch.get_notifications().await.unwrap();
        let seen: Vec<(&str, EventType, TaskStatus)> = notes
            .iter()
            .map(|n| (n.flow_id.as_str(), n.event_type, n.status))
            .collect();
        assert_eq!(
            seen,
            vec![
                ("author-1", EventType::TaskUpdated, TaskStatus::Processing),
                ("assignee-1", EventType::TaskUpdated, TaskStatus::Processing),
                ("author-1", EventType::TaskUpdated, TaskStatus::Failed),
                ("assignee-1", EventType::TaskUpdated, TaskStatus::Failed),
            ]
        );
    }

    #[tokio::test]
    async fn panicking_processor_marks_task_failed() {
        let registry = ProcessorRegistry::default().with("email", Arc::new(Panicking));
        let orch = test_orchestrator(registry).await;
        let task = orch.create_task(email_task()).await.unwrap();

        let done = orch.consume_task(task.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Failed);
        let error = done.result.unwrap()["error"].as_str().unwrap().to_string();
        assert!(error.contains("panicked"), "unexpected error: {error}");
    }

    #[tokio::test]
    async fn missing_processor_marks_task_failed() {
        let orch = test_orchestrator(ProcessorRegistry::empty()).await;
        let task = orch.create_task(email_task()).await.unwrap();

        let done = orch.consume_task(task.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Failed);
        let error = done.result.unwrap()["error"].as_str().unwrap().to_string();
        assert!(error.contains("email"));
    }

    #[tokio::test]
    async fn consume_twice_is_rejected() {
        let orch = test_orchestrator(ProcessorRegistry::default()).await;
        let task = orch.create_task(email_task()).await.unwrap();
        let done = orch.consume_task(task.id).await.unwrap();

        let result = orch.consume_task(task.id).await;
        assert!(matches!(
            result,
            Err(Error::Task(TaskError::InvalidState {
                status: TaskStatus::Completed,
                target: TaskStatus::Processing,
                ..
            }))
        ));
        assert_eq!(orch.get_task(task.id).await.unwrap(), done);
    }

    #[tokio::test]
    async fn consume_while_processing_is_rejected() {
        let orch = test_orchestrator(ProcessorRegistry::default()).await;
        let task = orch.create_task(email_task()).await.unwrap();
        let processing = orch
            .update_task(task.id, TaskUpdate::status(TaskStatus::Processing))
            .await
            .unwrap();
        orch.get_notifications().await.unwrap();

        let result = orch.consume_task(task.id).await;
        assert!(matches!(
            result,
            Err(Error::Task(TaskError::InvalidState {
                status: TaskStatus::Processing,
                target: TaskStatus::Processing,
                ..
            }))
        ));
        assert_eq!(orch.get_task(task.id).await.unwrap(), processing);
        assert!(orch.get_notifications().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn consume_after_failure_is_rejected() {
        let registry = ProcessorRegistry::default().with("email", Arc::new(Exploding));
        let orch = test_orchestrator(registry).await;
        let task = orch.create_task(email_task()).await.unwrap();
        let failed = orch.consume_task(task.id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        orch.get_notifications().await.unwrap();

        let result = orch.consume_task(task.id).await;
        assert!(matches!(
            result,
            Err(Error::Task(TaskError::InvalidState {
                status: TaskStatus::Failed,
                target: TaskStatus::Processing,
                ..
            }))
        ));
        assert_eq!(orch.get_task(task.id).await.unwrap(), failed);
        assert!(orch.get_notifications().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn consume_unknown_task_is_not_found() {
        let orch = test_orchestrator(ProcessorRegistry::default()).await;
        let result = orch.consume_task(Uuid::new_v4()).await;
        assert!(matches!(result, Err(Error::Task(TaskError::NotFound { .. }))));
    }

    #[tokio::test]
    async fn empty_update_still_notifies() {
        let orch = test_orchestrator(ProcessorRegistry::default()).await;
        let task = orch.create_task(email_task()).await.unwrap();
        orch.get_notifications().await.unwrap();

        let updated = orch.update_task(task.id, TaskUpdate::default()).await.unwrap();
        assert_eq!(updated, task);
        assert_eq!(orch.get_task(task.id).await.unwrap(), task);

        let notes = orch.get_notifications().await.unwrap();
        assert_eq!(notes.len(), 2);
        assert!(notes.iter().all(|n| n.event_type == EventType::TaskUpdated));
    }

    #[tokio::test]
    async fn update_rejects_illegal_status_change() {
        let orch = test_orchestrator(ProcessorRegistry::default()).await;
        let task = orch.create_task(email_task()).await.unwrap();
        orch.get_notifications().await.unwrap();

        let result = orch
            .update_task(task.id, TaskUpdate::status(TaskStatus::Completed).with_state("x"))
            .await;
        assert!(matches!(
            result,
            Err(Error::Task(TaskError::InvalidState {
                status: TaskStatus::Pending,
                target: TaskStatus::Completed,
                ..
            }))
        ));
        assert_eq!(orch.get_task(task.id).await.unwrap(), task);
        assert!(orch.get_notifications().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_allows_same_status_and_legal_moves() {
        let orch = test_orchestrator(ProcessorRegistry::default()).await;
        let task = orch.create_task(email_task()).await.unwrap();

        let same = orch
            .update_task(task.id, TaskUpdate::status(TaskStatus::Pending).with_state("review"))
            .await
            .unwrap();
        assert_eq!(same.status, TaskStatus::Pending);
        assert_eq!(same.state, "review");

        let moved = orch
            .update_task(task.id, TaskUpdate::status(TaskStatus::Processing))
            .await
            .unwrap();
        assert_eq!(moved.status, TaskStatus::Processing);
    }

    #[tokio::test]
    async fn update_unknown_task_is_not_found() {
        let orch = test_orchestrator(ProcessorRegistry::default()).await;
        let result = orch.update_task(Uuid::new_v4(), TaskUpdate::default()).await;
        assert!(matches!(result, Err(Error::Task(TaskError::NotFound { .. }))));
    }

    #[tokio::test]
    async fn delete_removes_task_and_job() {
        let orch = test_orchestrator(ProcessorRegistry::default()).await;
        let task = orch
            .create_task(email_task().with_cron("0 * * * *"))
            .await
            .unwrap();

        orch.delete_task(task.id).await.unwrap();
        assert!(matches!(
            orch.get_task(task.id).await,
            Err(Error::Task(TaskError::NotFound { .. }))
        ));
        assert!(
            orch.scheduler()
                .get_job(&task.id.to_string())
                .await
                .unwrap()
                .is_none()
        );
        assert!(matches!(
            orch.delete_task(task.id).await,
            Err(Error::Task(TaskError::NotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn subscribers_receive_matching_events() {
        let orch = test_orchestrator(ProcessorRegistry::default()).await;
        orch.subscribe_flow("all", EventType::TaskCreated, None, None)
            .await
            .unwrap();
        orch.subscribe_flow("emails", EventType::TaskCreated, Some("email".into()), None)
            .await
            .unwrap();
        orch.subscribe_flow("reports", EventType::TaskCreated, Some("report".into()), None)
            .await
            .unwrap();
        orch.subscribe_flow("updates", EventType::TaskUpdated, None, None)
            .await
            .unwrap();

        orch.create_task(email_task()).await.unwrap();
        let notes = orch.get_notifications().await.unwrap();
        let recipients: Vec<&str> = notes.iter().map(|n| n.flow_id.as_str()).collect();
        assert_eq!(recipients, vec!["author-1", "assignee-1", "all", "emails"]);
    }

    #[tokio::test]
    async fn author_who_subscribes_is_notified_twice() {
        let orch = test_orchestrator(ProcessorRegistry::default()).await;
        orch.subscribe_flow("author-1", EventType::TaskCreated, None, None)
            .await
            .unwrap();

        orch.create_task(email_task()).await.unwrap();
        let notes = orch.get_notifications().await.unwrap();
        let to_author = notes.iter().filter(|n| n.flow_id == "author-1").count();
        assert_eq!(to_author, 2);
    }

    #[tokio::test]
    async fn unsubscribe_narrows_by_filters() {
        let orch = test_orchestrator(ProcessorRegistry::default()).await;
        orch.subscribe_flow("watcher", EventType::TaskCreated, None, None)
            .await
            .unwrap();
        orch.subscribe_flow("watcher", EventType::TaskCreated, Some("email".into()), None)
            .await
            .unwrap();

        let removed = orch
            .unsubscribe_flow("watcher", EventType::TaskCreated, Some("email".into()), None)
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let removed = orch
            .unsubscribe_flow("watcher", EventType::TaskCreated, None, None)
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(orch.get_subscriptions("watcher").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn subscribe_rejects_blank_flow() {
        let orch = test_orchestrator(ProcessorRegistry::default()).await;
        let result = orch.subscribe_flow("", EventType::TaskCreated, None, None).await;
        assert!(matches!(result, Err(Error::Task(TaskError::Validation(_)))));
    }

    #[tokio::test]
    async fn notifications_drain_once() {
        let orch = test_orchestrator(ProcessorRegistry::default()).await;
        assert!(orch.get_notifications().await.unwrap().is_empty());

        orch.create_task(email_task()).await.unwrap();
        assert_eq!(orch.get_notifications().await.unwrap().len(), 2);
        assert!(orch.get_notifications().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn job_handler_rejects_malformed_jobs() {
        let orch = Arc::new(test_orchestrator(ProcessorRegistry::default()).await);
        let handler = ConsumeTaskHandler {
            orchestrator: Arc::downgrade(&orch),
        };
        let now = chrono::Utc::now();
        let mut job = ScheduledJob {
            id: "job".into(),
            callback: "something_else".into(),
            args: json!([]),
            trigger: JobTrigger::Immediate,
            next_run_at: now,
            revision: 1,
            created_at: now,
            updated_at: now,
        };
        assert!(handler.run_job(&job).await.is_err());

        job.callback = CONSUME_TASK_CALLBACK.into();
        job.args = json!(["not-a-uuid"]);
        assert!(handler.run_job(&job).await.is_err());
    }
}

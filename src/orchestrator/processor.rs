//! Task processors, looked up by task category.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::ProcessError;
use crate::tasks::model::Task;

/// Business logic for one task category.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    /// Run the task. The returned value is stored as the task's result.
    async fn process(&self, task: &Task) -> Result<Value, ProcessError>;
}

/// Marks the task done without doing any work.
pub struct AcknowledgeProcessor;

#[async_trait]
impl TaskProcessor for AcknowledgeProcessor {
    async fn process(&self, _task: &Task) -> Result<Value, ProcessError> {
        Ok(json!({"result": "Task processed successfully"}))
    }
}

/// Category → processor map with an optional fallback.
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn TaskProcessor>>,
    fallback: Option<Arc<dyn TaskProcessor>>,
}

impl ProcessorRegistry {
    /// Registry with no processors and no fallback.
    pub fn empty() -> Self {
        Self {
            processors: HashMap::new(),
            fallback: None,
        }
    }

    /// Register `processor` for `category`, replacing any previous one.
    pub fn register(&mut self, category: impl Into<String>, processor: Arc<dyn TaskProcessor>) {
        let category = category.into();
        tracing::debug!(category = %category, "Registered task processor");
        self.processors.insert(category, processor);
    }

    /// Builder: register a processor.
    pub fn with(mut self, category: impl Into<String>, processor: Arc<dyn TaskProcessor>) -> Self {
        self.register(category, processor);
        self
    }

    /// Builder: set the processor used for unregistered categories.
    pub fn with_fallback(mut self, processor: Arc<dyn TaskProcessor>) -> Self {
        self.fallback = Some(processor);
        self
    }

    /// Builder: drop the fallback.
    pub fn without_fallback(mut self) -> Self {
        self.fallback = None;
        self
    }

    pub fn get(&self, category: &str) -> Option<Arc<dyn TaskProcessor>> {
        self.processors
            .get(category)
            .or(self.fallback.as_ref())
            .cloned()
    }

    pub fn categories(&self) -> Vec<&str> {
        let mut categories: Vec<&str> = self.processors.keys().map(String::as_str).collect();
        categories.sort_unstable();
        categories
    }
}

impl Default for ProcessorRegistry {
    /// Empty registry that acknowledges every task.
    fn default() -> Self {
        Self::empty().with_fallback(Arc::new(AcknowledgeProcessor))
    }
}

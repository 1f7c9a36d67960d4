//! Task orchestration: lifecycle, scheduling and notification fan-out.

pub mod processor;
pub mod service;

pub use processor::{AcknowledgeProcessor, ProcessorRegistry, TaskProcessor};
pub use service::{CONSUME_TASK_CALLBACK, TaskOrchestrator};

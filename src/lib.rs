//! Task orchestrator: persistent task lifecycle, job scheduling and
//! notification fan-out.

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod tasks;

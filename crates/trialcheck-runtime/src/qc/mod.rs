//! Batch QC: the run engine and its scheduler

mod engine;
mod scheduler;

pub use engine::{CancelHandle, EngineState, QcConfig, QcEngine, ScheduledPlan};
pub use scheduler::{DueRunner, Scheduler, SchedulerHandle};

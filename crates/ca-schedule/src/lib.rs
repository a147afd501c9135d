//! 遅延タスク実行モジュール
//!
//! Durable delayed tasks keyed by string with replace-on-insert semantics,
//! and the two task handlers built on them: the periodic calendar sync and
//! the alert dispatcher.

mod dispatcher;
mod error;
mod handler;
mod orchestrator;
mod scheduler;

pub use dispatcher::AlertDispatcher;
pub use error::{Result, ScheduleError};
pub use handler::{FiredTask, TaskHandler};
pub use orchestrator::{
    CycleOutcome, CyclePhase, CycleReport, SyncOrchestrator, SyncTaskHandler, SYNC_TASK_TYPE,
    SYNC_WORK_KEY,
};
pub use scheduler::{DelayedScheduler, RestoreReport, MAX_SLEEP_SLICE};

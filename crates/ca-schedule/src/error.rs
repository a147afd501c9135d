//! エラー型定義 (ca-schedule)

use thiserror::Error;

/// ca-schedule のエラー型
#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("Core error: {0}")]
    Core(#[from] ca_core::Error),

    #[error("No handler registered for task type: {0}")]
    HandlerNotFound(String),

    #[error("Task failed: {0}")]
    Handler(String),
}

/// Result 型エイリアス
pub type Result<T> = std::result::Result<T, ScheduleError>;

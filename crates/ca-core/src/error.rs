//! Error types for ca-core

use thiserror::Error;

/// Main error type for ca-core
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store write failed: {0}")]
    StoreWrite(String),

    #[error("Invalid alert payload: {0}")]
    InvalidPayload(String),

    #[error("Unsupported sync frequency: {0} minutes (expected 15, 30, 60, 180 or 360)")]
    InvalidFrequency(u32),

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error("{0}")]
    Other(String),
}

/// Result type alias for ca-core
pub type Result<T> = std::result::Result<T, Error>;

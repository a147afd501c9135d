//! Event source interfaces
//!
//! The sync cycle reads events from two collaborators: the local calendar
//! store, which is mandatory, and an optional remote account.

use async_trait::async_trait;
use std::collections::BTreeSet;
use thiserror::Error;

use crate::event::{Event, TimeWindow};

/// Failure reported by an event source
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Authentication expired: {0}")]
    AuthExpired(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for event sources
pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// Calendars stored on this machine
#[async_trait]
pub trait LocalEventSource: Send + Sync {
    /// Fetch events of the given calendars that start inside `window`
    ///
    /// # Errors
    /// `PermissionDenied` when the calendar store cannot be read.
    async fn fetch_local_events(
        &self,
        calendar_ids: &BTreeSet<String>,
        window: &TimeWindow,
    ) -> SourceResult<Vec<Event>>;
}

/// An authenticated session with a remote calendar account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSession {
    /// Account the session belongs to
    pub account: String,
}

impl RemoteSession {
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
        }
    }
}

/// A remote calendar account
#[async_trait]
pub trait RemoteEventSource: Send + Sync {
    /// The active session, or `None` when not signed in
    fn session(&self) -> Option<RemoteSession>;

    /// Fetch events that start inside `window`
    ///
    /// # Errors
    /// `AuthExpired` or `NetworkError`.
    async fn fetch_remote_events(
        &self,
        session: &RemoteSession,
        window: &TimeWindow,
    ) -> SourceResult<Vec<Event>>;
}

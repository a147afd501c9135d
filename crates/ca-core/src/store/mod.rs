//! Durable storage
//!
//! Both stores live in the same SQLite database file: the scheduling store
//! holds one entry per outstanding delayed task, the settings store holds the
//! persisted sync state.

mod schedule;
mod settings;

pub use schedule::{ScheduleStore, ScheduledEntry};
pub use settings::{SettingsStore, SqliteSettings, SyncFrequency, SyncState};

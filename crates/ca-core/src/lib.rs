//! ca-core: Calendar Alarm Core Library
//!
//! Event model, alert planning, durable scheduling store, persisted sync
//! state and the interfaces of the collaborators the sync engine talks to.

pub mod alert;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod notify;
pub mod source;
pub mod store;

pub use alert::{AlertKind, AlertPayload, AlertTask, ALERT_TASK_TYPE};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, LocalConfig, RemoteConfig, StoreConfig, SyncConfig};
pub use error::{Error, Result};
pub use event::{Event, TimeWindow, UNTITLED_EVENT};
pub use notify::{AlertNotice, NotificationRenderer};
pub use source::{LocalEventSource, RemoteEventSource, RemoteSession, SourceError, SourceResult};
pub use store::{ScheduleStore, ScheduledEntry, SettingsStore, SqliteSettings, SyncFrequency, SyncState};

//! Persisted sync settings
//!
//! A tiny key-value table holds the process-wide sync state so that it
//! survives restarts. The state is loaded at the start of every cycle and
//! passed around as a plain value.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Mutex;

use crate::{Error, Result};

const KEY_LAST_SYNC: &str = "last_sync_time";
const KEY_SYNC_FREQUENCY: &str = "sync_frequency";
const KEY_SELECTED_CALENDARS: &str = "selected_calendars";

/// Durable key-value settings
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// SQLite-backed [`SettingsStore`]
pub struct SqliteSettings {
    conn: Mutex<Connection>,
}

impl SqliteSettings {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        Self::with_connection(conn)
    }

    /// Create an in-memory settings store (for testing)
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl SettingsStore for SqliteSettings {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }
}

/// Recognized sync intervals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum SyncFrequency {
    Minutes15,
    Minutes30,
    #[default]
    Hour1,
    Hours3,
    Hours6,
}

impl SyncFrequency {
    pub const ALL: [SyncFrequency; 5] = [
        Self::Minutes15,
        Self::Minutes30,
        Self::Hour1,
        Self::Hours3,
        Self::Hours6,
    ];

    pub const fn minutes(&self) -> u32 {
        match self {
            Self::Minutes15 => 15,
            Self::Minutes30 => 30,
            Self::Hour1 => 60,
            Self::Hours3 => 180,
            Self::Hours6 => 360,
        }
    }

    pub fn interval(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.minutes()))
    }
}

impl TryFrom<u32> for SyncFrequency {
    type Error = Error;

    fn try_from(minutes: u32) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|f| f.minutes() == minutes)
            .ok_or(Error::InvalidFrequency(minutes))
    }
}

impl From<SyncFrequency> for u32 {
    fn from(frequency: SyncFrequency) -> Self {
        frequency.minutes()
    }
}

impl fmt::Display for SyncFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} min", self.minutes())
    }
}

/// Process-wide sync state
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncState {
    /// End of the last successful cycle
    pub last_sync_at: Option<DateTime<Utc>>,
    pub sync_frequency: SyncFrequency,
    pub selected_calendar_ids: BTreeSet<String>,
}

impl SyncState {
    /// Load the state, falling back to defaults for missing keys
    ///
    /// Unreadable values are logged and replaced by their default rather
    /// than failing the caller.
    pub fn load(settings: &dyn SettingsStore) -> Result<Self> {
        let last_sync_at = settings.get(KEY_LAST_SYNC)?.and_then(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| tracing::warn!("Ignoring unreadable {}: {}", KEY_LAST_SYNC, e))
                .ok()
        });

        let sync_frequency = settings
            .get(KEY_SYNC_FREQUENCY)?
            .and_then(|raw| {
                raw.parse::<u32>()
                    .map_err(|e| Error::Config(e.to_string()))
                    .and_then(SyncFrequency::try_from)
                    .map_err(|e| tracing::warn!("Ignoring {}: {}", KEY_SYNC_FREQUENCY, e))
                    .ok()
            })
            .unwrap_or_default();

        let selected_calendar_ids = settings
            .get(KEY_SELECTED_CALENDARS)?
            .and_then(|raw| {
                serde_json::from_str::<BTreeSet<String>>(&raw)
                    .map_err(|e| tracing::warn!("Error parsing selected calendars: {}", e))
                    .ok()
            })
            .unwrap_or_default();

        Ok(Self {
            last_sync_at,
            sync_frequency,
            selected_calendar_ids,
        })
    }

    /// Persist the time of a successful cycle
    pub fn record_sync(settings: &dyn SettingsStore, at: DateTime<Utc>) -> Result<()> {
        settings.set(KEY_LAST_SYNC, &at.to_rfc3339())
    }

    pub fn set_frequency(settings: &dyn SettingsStore, frequency: SyncFrequency) -> Result<()> {
        settings.set(KEY_SYNC_FREQUENCY, &frequency.minutes().to_string())
    }

    pub fn set_selected_calendars(
        settings: &dyn SettingsStore,
        calendar_ids: &BTreeSet<String>,
    ) -> Result<()> {
        settings.set(KEY_SELECTED_CALENDARS, &serde_json::to_string(calendar_ids)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_frequency_options() {
        for minutes in [15, 30, 60, 180, 360] {
            assert_eq!(SyncFrequency::try_from(minutes).unwrap().minutes(), minutes);
        }
        assert!(matches!(SyncFrequency::try_from(45), Err(Error::InvalidFrequency(45))));
        assert_eq!(SyncFrequency::default(), SyncFrequency::Hour1);
    }

    #[test]
    fn test_frequency_serde() {
        let parsed: SyncFrequency = serde_json::from_str("180").unwrap();
        assert_eq!(parsed, SyncFrequency::Hours3);
        assert!(serde_json::from_str::<SyncFrequency>("7").is_err());
        assert_eq!(serde_json::to_string(&SyncFrequency::Minutes15).unwrap(), "15");
    }

    #[test]
    fn test_load_defaults() {
        let settings = SqliteSettings::in_memory().unwrap();
        let state = SyncState::load(&settings).unwrap();
        assert_eq!(state, SyncState::default());
    }

    #[test]
    fn test_round_trip() {
        let settings = SqliteSettings::in_memory().unwrap();
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let calendars: BTreeSet<String> = ["1".to_string(), "work".to_string()].into();

        SyncState::record_sync(&settings, at).unwrap();
        SyncState::set_frequency(&settings, SyncFrequency::Minutes30).unwrap();
        SyncState::set_selected_calendars(&settings, &calendars).unwrap();

        let state = SyncState::load(&settings).unwrap();
        assert_eq!(state.last_sync_at, Some(at));
        assert_eq!(state.sync_frequency, SyncFrequency::Minutes30);
        assert_eq!(state.selected_calendar_ids, calendars);
    }

    #[test]
    fn test_unreadable_values_fall_back() {
        let settings = SqliteSettings::in_memory().unwrap();
        settings.set(KEY_SYNC_FREQUENCY, "45").unwrap();
        settings.set(KEY_SELECTED_CALENDARS, "not json").unwrap();
        settings.set(KEY_LAST_SYNC, "yesterday").unwrap();

        let state = SyncState::load(&settings).unwrap();
        assert_eq!(state, SyncState::default());
    }
}

//! Alert task types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::event::{Event, UNTITLED_EVENT};
use crate::{Error, Result};

/// Task type under which alert tasks are registered with the scheduler
pub const ALERT_TASK_TYPE: &str = "event_notification";

const KEY_PREFIX: &str = "event_notification_";
const NOTIFICATION_ID_BASE: u32 = 1000;

/// When an alert fires relative to its event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlertKind {
    /// Ten minutes before the event starts
    #[serde(rename = "10_min_before")]
    TenMinuteBefore,
    /// When the event starts
    #[serde(rename = "event_time")]
    AtStart,
}

impl AlertKind {
    /// Wire identifier stored with the scheduled task
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::TenMinuteBefore => "10_min_before",
            Self::AtStart => "event_time",
        }
    }

    const fn notification_suffix(&self) -> u32 {
        match self {
            Self::TenMinuteBefore => 0,
            Self::AtStart => 1,
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "10_min_before" => Ok(Self::TenMinuteBefore),
            "event_time" => Ok(Self::AtStart),
            other => Err(Error::InvalidPayload(format!("unknown alert kind: {}", other))),
        }
    }
}

fn event_digest(event_id: &str) -> [u8; 32] {
    Sha256::digest(event_id.as_bytes()).into()
}

/// Deterministic scheduling key for an event's alert
///
/// The same event id and kind always produce the same key, across cycles
/// and process restarts.
pub fn alert_key(event_id: &str, kind: AlertKind) -> String {
    let digest = event_digest(event_id);
    format!("{}{}_{}", KEY_PREFIX, hex::encode(&digest[..8]), kind.as_str())
}

/// Stable notification id so a renderer can replace a repeated delivery
/// of the same alert instead of stacking a second one
///
/// The low bit carries the kind, so ids of different events never overlap.
pub fn notification_id(event_id: &str, kind: AlertKind) -> u32 {
    let digest = event_digest(event_id);
    let base = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) & 0x07ff_ffff;
    NOTIFICATION_ID_BASE + (base << 1) + kind.notification_suffix()
}

/// Data captured at planning time and rendered when the alert fires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertPayload {
    pub event_id: String,
    pub title: String,
    #[serde(default)]
    pub location: Option<String>,
    /// Start of the event the alert refers to
    pub start: DateTime<Utc>,
}

/// Stored form of a payload; every field is optional so that a damaged
/// entry is reported as `InvalidPayload` instead of a JSON error.
#[derive(Debug, Deserialize)]
struct StoredPayload {
    event_id: Option<String>,
    title: Option<String>,
    location: Option<String>,
    start: Option<DateTime<Utc>>,
    kind: Option<String>,
}

impl AlertPayload {
    pub fn from_event(event: &Event) -> Self {
        Self {
            event_id: event.id.clone(),
            title: event.title.clone(),
            location: event.location.clone(),
            start: event.start,
        }
    }

    /// Serialize together with the kind identifier
    pub fn to_json(&self, kind: AlertKind) -> Result<JsonValue> {
        let mut value = serde_json::to_value(self)?;
        if let JsonValue::Object(map) = &mut value {
            map.insert("kind".to_string(), JsonValue::String(kind.as_str().to_string()));
        }
        Ok(value)
    }

    /// Parse a stored payload, returning it with its raw kind identifier
    ///
    /// The kind is returned unparsed; resolving it is up to the dispatcher.
    pub fn from_json(value: &JsonValue) -> Result<(Self, String)> {
        let stored: StoredPayload = serde_json::from_value(value.clone())
            .map_err(|e| Error::InvalidPayload(e.to_string()))?;

        let event_id = stored
            .event_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::InvalidPayload("missing event_id".to_string()))?;
        let start = stored
            .start
            .filter(|start| start.timestamp_millis() != 0)
            .ok_or_else(|| Error::InvalidPayload(format!("missing start for event {}", event_id)))?;
        let kind = stored
            .kind
            .ok_or_else(|| Error::InvalidPayload(format!("missing kind for event {}", event_id)))?;

        let payload = Self {
            event_id,
            title: stored.title.unwrap_or_else(|| UNTITLED_EVENT.to_string()),
            location: stored.location,
            start,
        };
        Ok((payload, kind))
    }
}

/// One planned alert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertTask {
    /// Idempotency key, see [`alert_key`]
    pub key: String,
    pub event_id: String,
    pub kind: AlertKind,
    pub fire_at: DateTime<Utc>,
    pub payload: AlertPayload,
}

impl AlertTask {
    pub fn new(event: &Event, kind: AlertKind, fire_at: DateTime<Utc>) -> Self {
        Self {
            key: alert_key(&event.id, kind),
            event_id: event.id.clone(),
            kind,
            fire_at,
            payload: AlertPayload::from_event(event),
        }
    }

    pub fn payload_json(&self) -> Result<JsonValue> {
        self.payload.to_json(self.kind)
    }
}

//! Calendar event model

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Number of days ahead of `now` that a sync cycle looks for events
pub const LOOKAHEAD_DAYS: i64 = 7;

/// Title used when a source provides an event without one
pub const UNTITLED_EVENT: &str = "Untitled Event";

/// A calendar event as produced by an event source
///
/// Events are plain values: sources build them, the alert planner only reads them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Identifier within the source calendar
    pub id: String,
    /// Event title
    pub title: String,
    /// Start instant
    pub start: DateTime<Utc>,
    /// End instant
    pub end: DateTime<Utc>,
    /// Event location
    #[serde(default)]
    pub location: Option<String>,
    /// Calendar the event was read from
    pub source_calendar_id: String,
}

impl Event {
    /// Create a new event without a location
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        source_calendar_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            start,
            end,
            location: None,
            source_calendar_id: source_calendar_id.into(),
        }
    }

    /// Set the location
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Whether the event starts strictly after `now`
    pub fn is_upcoming(&self, now: DateTime<Utc>) -> bool {
        self.start > now
    }
}

/// Closed time interval `[start, end]` used to query event sources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The standard sync window: `[now, now + 7 days]`
    pub fn lookahead(now: DateTime<Utc>) -> Self {
        Self::new(now, now + Duration::days(LOOKAHEAD_DAYS))
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant <= self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_event_builder() {
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let event = Event::new("e1", "Standup", start, start + Duration::minutes(30), "work")
            .with_location("Room 4");

        assert_eq!(event.location.as_deref(), Some("Room 4"));
        assert!(event.is_upcoming(start - Duration::seconds(1)));
        assert!(!event.is_upcoming(start));
    }

    #[test]
    fn test_lookahead_window() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let window = TimeWindow::lookahead(now);

        assert!(window.contains(now));
        assert!(window.contains(now + Duration::days(7)));
        assert!(!window.contains(now + Duration::days(7) + Duration::seconds(1)));
        assert!(!window.contains(now - Duration::seconds(1)));
    }
}

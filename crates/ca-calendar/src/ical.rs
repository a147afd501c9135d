//! iCalendar reading
//!
//! Extracts the VEVENT fields needed for alerting. Recurrence rules are not
//! expanded here and times with a `TZID` parameter are read as local time.
//! An instance carrying `RECURRENCE-ID` gets its own event id, so a moved
//! occurrence and its series never share alert keys.

use ca_core::{Event, UNTITLED_EVENT};
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use icalendar::parser::{Component, read_calendar, unfold};
use icalendar::{CalendarDateTime, DatePerhapsTime};
use tracing::{debug, warn};

/// A DTSTART/DTEND value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcalTime {
    /// A timed instant
    DateTime(DateTime<Utc>),
    /// A date without time, used by all-day events
    Date(NaiveDate),
}

impl IcalTime {
    pub fn is_date(&self) -> bool {
        matches!(self, IcalTime::Date(_))
    }

    /// The instant; dates map to local midnight
    pub fn to_utc(self) -> Option<DateTime<Utc>> {
        match self {
            IcalTime::DateTime(dt) => Some(dt),
            IcalTime::Date(date) => local_to_utc(date.and_hms_opt(0, 0, 0)?),
        }
    }
}

/// One parsed VEVENT component
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VEvent {
    pub uid: Option<String>,
    /// Raw `RECURRENCE-ID` value of an overridden or expanded instance
    pub recurrence_id: Option<String>,
    pub summary: Option<String>,
    pub start: Option<IcalTime>,
    pub end: Option<IcalTime>,
    pub location: Option<String>,
}

impl VEvent {
    fn from_component(vevent: &Component<'_>) -> Self {
        let text = |name: &str| vevent.find_prop(name).map(|p| unescape_text(p.val.as_ref()));
        let time = |name: &str| {
            vevent
                .find_prop(name)
                .and_then(|p| DatePerhapsTime::try_from(p).ok())
                .and_then(to_ical_time)
        };

        Self {
            uid: vevent.find_prop("UID").map(|p| p.val.to_string().trim().to_string()),
            recurrence_id: vevent
                .find_prop("RECURRENCE-ID")
                .map(|p| p.val.to_string().trim().to_string())
                .filter(|r| !r.is_empty()),
            summary: text("SUMMARY"),
            start: time("DTSTART"),
            end: time("DTEND"),
            location: text("LOCATION"),
        }
    }

    /// `UID`, suffixed with the recurrence id for a single instance
    pub fn event_id(&self) -> Option<String> {
        let uid = self.uid.as_deref().filter(|u| !u.is_empty())?;
        Some(match &self.recurrence_id {
            Some(recurrence_id) => format!("{}_{}", uid, recurrence_id),
            None => uid.to_string(),
        })
    }

    /// Convert to an [`Event`] of `calendar_id`
    ///
    /// Returns `None` for events without UID or DTSTART, and for all-day
    /// events unless `include_all_day` is set.
    pub fn to_event(&self, calendar_id: &str, include_all_day: bool) -> Option<Event> {
        let Some(id) = self.event_id() else {
            debug!("Skipping VEVENT without UID");
            return None;
        };
        let Some(start_value) = self.start else {
            debug!(id = %id, "Skipping VEVENT without DTSTART");
            return None;
        };
        if start_value.is_date() && !include_all_day {
            return None;
        }

        let start = start_value.to_utc()?;
        let end = self.end.and_then(IcalTime::to_utc).unwrap_or(start);
        let title = self
            .summary
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(UNTITLED_EVENT);

        let mut event = Event::new(id, title, start, end, calendar_id);
        if let Some(location) = self.location.as_deref().filter(|l| !l.is_empty()) {
            event = event.with_location(location);
        }
        Some(event)
    }
}

/// Parse every VEVENT in an iCalendar document
///
/// An unparseable document yields no events.
pub fn parse_vevents(ical: &str) -> Vec<VEvent> {
    let unfolded = unfold(ical.trim());
    let calendar = match read_calendar(&unfolded) {
        Ok(calendar) => calendar,
        Err(e) => {
            warn!("Failed to parse iCalendar data: {:?}", e);
            return Vec::new();
        }
    };

    calendar
        .components
        .iter()
        .filter(|c| c.name == "VEVENT")
        .map(VEvent::from_component)
        .collect()
}

fn to_ical_time(value: DatePerhapsTime) -> Option<IcalTime> {
    match value {
        DatePerhapsTime::Date(date) => Some(IcalTime::Date(date)),
        DatePerhapsTime::DateTime(CalendarDateTime::Utc(dt)) => Some(IcalTime::DateTime(dt)),
        DatePerhapsTime::DateTime(CalendarDateTime::Floating(naive)) => {
            local_to_utc(naive).map(IcalTime::DateTime)
        }
        DatePerhapsTime::DateTime(CalendarDateTime::WithTimezone { date_time, .. }) => {
            local_to_utc(date_time).map(IcalTime::DateTime)
        }
    }
}

fn local_to_utc(naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Undo RFC 5545 TEXT escaping
fn unescape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

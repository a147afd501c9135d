//! Alert planner
//!
//! Pure mapping from `(events, now)` to the alerts that are still due.
//! Events that already started produce nothing: a cycle that runs late
//! never fires catch-up alerts for events in progress.

use chrono::{DateTime, Duration, Utc};

use super::types::{AlertKind, AlertTask};
use crate::event::Event;

/// Lead time of the early alert, in minutes
pub const ALERT_LEAD_MINUTES: i64 = 10;

/// Lead time of the early alert
pub fn lead_time() -> Duration {
    Duration::minutes(ALERT_LEAD_MINUTES)
}

/// Plan alerts for `events` as seen at `now`
///
/// For each event starting after `now` an `AtStart` alert is planned, and a
/// `TenMinuteBefore` alert as well when more than ten minutes remain.
/// Event duration is irrelevant.
pub fn plan(events: &[Event], now: DateTime<Utc>) -> Vec<AlertTask> {
    let mut tasks = Vec::with_capacity(events.len() * 2);

    let lead = lead_time();

    for event in events.iter().filter(|e| e.is_upcoming(now)) {
        if event.start - now > lead {
            tasks.push(AlertTask::new(event, AlertKind::TenMinuteBefore, event.start - lead));
        }
        tasks.push(AlertTask::new(event, AlertKind::AtStart, event.start));
    }

    tasks
}

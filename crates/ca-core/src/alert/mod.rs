//! Alert model and planning
//!
//! An alert is one user-facing reminder for one event and one timing kind.
//! The planner turns a set of events into alert tasks keyed so that
//! re-planning the same event replaces, never duplicates, its alerts.

mod planner;
mod types;

pub use planner::{lead_time, plan, ALERT_LEAD_MINUTES};
pub use types::{alert_key, notification_id, AlertKind, AlertPayload, AlertTask, ALERT_TASK_TYPE};

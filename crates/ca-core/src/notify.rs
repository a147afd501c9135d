//! Notification rendering interface

use chrono::{DateTime, Utc};

use crate::alert::{notification_id, AlertKind, AlertPayload};

/// Everything a renderer needs to show one alert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertNotice {
    /// Stable per event and kind; showing the same id twice should
    /// replace the earlier notification
    pub notification_id: u32,
    pub kind: AlertKind,
    pub title: String,
    pub location: Option<String>,
    pub start: DateTime<Utc>,
}

impl AlertNotice {
    pub fn new(payload: &AlertPayload, kind: AlertKind) -> Self {
        Self {
            notification_id: notification_id(&payload.event_id, kind),
            kind,
            title: payload.title.clone(),
            location: payload.location.clone(),
            start: payload.start,
        }
    }

    /// Headline for the notification
    pub fn headline(&self) -> String {
        match self.kind {
            AlertKind::TenMinuteBefore => format!("{} starts in 10 minutes", self.title),
            AlertKind::AtStart => format!("{} is starting now", self.title),
        }
    }

    /// Body text: the location, or empty
    pub fn body(&self) -> &str {
        self.location.as_deref().unwrap_or("")
    }
}

/// Shows alerts to the user
///
/// Rendering is fire-and-forget and must tolerate concurrent calls.
pub trait NotificationRenderer: Send + Sync {
    fn render_alert(&self, notice: &AlertNotice);
}

//! Alert dispatch
//!
//! Renders a fired alert strictly from the payload captured when it was
//! scheduled. The event is never fetched again, so an alert for an event
//! that has since moved or been deleted still shows what was scheduled.

use async_trait::async_trait;
use ca_core::{ALERT_TASK_TYPE, AlertKind, AlertNotice, AlertPayload, NotificationRenderer};
use std::sync::Arc;
use tracing::{debug, info};

use crate::Result;
use crate::handler::{FiredTask, TaskHandler};
use crate::scheduler::DelayedScheduler;

/// Turns fired alert tasks into notifications
pub struct AlertDispatcher {
    renderer: Arc<dyn NotificationRenderer>,
}

impl AlertDispatcher {
    pub fn new(renderer: Arc<dyn NotificationRenderer>) -> Self {
        Self { renderer }
    }

    /// Render the alert described by `payload`
    ///
    /// # Errors
    /// `InvalidPayload` when `kind` is not a known alert kind. Nothing is
    /// rendered in that case.
    pub fn dispatch(&self, payload: &AlertPayload, kind: &str) -> ca_core::Result<AlertKind> {
        let kind: AlertKind = kind.parse()?;
        let notice = AlertNotice::new(payload, kind);
        debug!(
            notification_id = notice.notification_id,
            event_id = %payload.event_id,
            kind = %kind,
            "Rendering alert"
        );
        self.renderer.render_alert(&notice);
        Ok(kind)
    }
}

#[async_trait]
impl TaskHandler for AlertDispatcher {
    fn task_type(&self) -> &str {
        ALERT_TASK_TYPE
    }

    async fn run(&self, _scheduler: &DelayedScheduler, task: FiredTask) -> Result<()> {
        let (payload, kind) = AlertPayload::from_json(&task.payload)?;
        let kind = self.dispatch(&payload, &kind)?;
        info!(key = %task.key, kind = %kind, title = %payload.title, "Alert delivered");
        Ok(())
    }
}

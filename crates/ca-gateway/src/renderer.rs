//! Console notification renderer

use ca_core::{AlertNotice, NotificationRenderer};
use chrono::Local;
use nu_ansi_term::{Color, Style};
use tracing::info;

/// Prints alerts to stdout
pub struct ConsoleRenderer {
    headline: Style,
    detail: Style,
}

impl ConsoleRenderer {
    pub fn new() -> Self {
        Self {
            headline: Color::Yellow.bold(),
            detail: Style::new().dimmed(),
        }
    }
}

impl Default for ConsoleRenderer {
    fn default() -> Self {
        Self::new()
    }
}

/// Plain text lines of a notice: headline, then location and start time
fn notice_lines(notice: &AlertNotice) -> (String, Vec<String>) {
    let mut details = Vec::new();
    if !notice.body().is_empty() {
        details.push(notice.body().to_string());
    }
    details.push(format!(
        "{} (#{})",
        notice.start.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
        notice.notification_id
    ));
    (notice.headline(), details)
}

impl NotificationRenderer for ConsoleRenderer {
    fn render_alert(&self, notice: &AlertNotice) {
        info!(
            notification_id = notice.notification_id,
            kind = %notice.kind,
            "Showing alert"
        );

        let (headline, details) = notice_lines(notice);
        println!();
        println!("🔔 {}", self.headline.paint(headline));
        for line in details {
            println!("   {}", self.detail.paint(line));
        }
        println!();
    }
}

//! Local calendars stored as `.ics` files
//!
//! Layout: one subdirectory per calendar under a root directory, each
//! holding any number of `.ics` files.
//!
//! ```text
//! calendars/
//!   work/
//!     standup.ics
//!   home/
//!     export.ics
//! ```

use async_trait::async_trait;
use ca_core::{Event, LocalEventSource, SourceResult, TimeWindow};
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{CalendarError, Result};
use crate::ical::parse_vevents;

/// Reads events from a directory of per-calendar `.ics` folders
#[derive(Debug, Clone)]
pub struct IcsDirectorySource {
    root: PathBuf,
}

impl IcsDirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Names of the available calendars, sorted
    pub async fn list_calendars(&self) -> Result<Vec<String>> {
        let mut dir = self.open_root().await?;
        let mut calendars = Vec::new();

        while let Some(entry) = dir.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    calendars.push(name.to_string());
                }
            }
        }

        calendars.sort();
        Ok(calendars)
    }

    /// Events of the selected calendars starting inside `window`, sorted by start
    pub async fn get_events(
        &self,
        calendar_ids: &BTreeSet<String>,
        window: &TimeWindow,
    ) -> Result<Vec<Event>> {
        if calendar_ids.is_empty() {
            warn!("No calendars selected, skipping local calendars");
            return Ok(Vec::new());
        }

        // Fail the whole fetch when the root itself is unreadable
        drop(self.open_root().await?);

        let mut events = Vec::new();
        for calendar_id in calendar_ids {
            if !is_plain_name(calendar_id) {
                warn!(calendar_id = %calendar_id, "Ignoring invalid calendar id");
                continue;
            }
            events.extend(self.read_calendar(calendar_id, window).await?);
        }

        events.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.id.cmp(&b.id)));
        info!(count = events.len(), calendars = calendar_ids.len(), "Fetched local events");
        Ok(events)
    }

    async fn open_root(&self) -> Result<tokio::fs::ReadDir> {
        tokio::fs::read_dir(&self.root).await.map_err(|e| {
            CalendarError::AccessDenied(format!("{}: {}", self.root.display(), e))
        })
    }

    async fn read_calendar(&self, calendar_id: &str, window: &TimeWindow) -> Result<Vec<Event>> {
        let dir_path = self.root.join(calendar_id);
        let mut dir = match tokio::fs::read_dir(&dir_path).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(calendar_id = %calendar_id, "Selected calendar not found");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(CalendarError::AccessDenied(format!(
                    "{}: {}",
                    dir_path.display(),
                    e
                )));
            }
        };

        let mut events = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let is_ics = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("ics"));
            if !is_ics {
                continue;
            }

            let text = match tokio::fs::read_to_string(&path).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(path = %path.display(), "Skipping unreadable file: {}", e);
                    continue;
                }
            };

            let parsed = parse_vevents(&text);
            debug!(path = %path.display(), count = parsed.len(), "Parsed calendar file");
            events.extend(
                parsed
                    .iter()
                    .filter_map(|v| v.to_event(calendar_id, true))
                    .filter(|e| window.contains(e.start)),
            );
        }

        Ok(events)
    }
}

/// A calendar id must name a direct child of the root
fn is_plain_name(id: &str) -> bool {
    !id.is_empty() && id != "." && id != ".." && !id.contains(['/', '\\'])
}

#[async_trait]
impl LocalEventSource for IcsDirectorySource {
    async fn fetch_local_events(
        &self,
        calendar_ids: &BTreeSet<String>,
        window: &TimeWindow,
    ) -> SourceResult<Vec<Event>> {
        Ok(self.get_events(calendar_ids, window).await?)
    }
}

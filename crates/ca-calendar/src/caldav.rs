//! CalDAV remote calendar

use async_trait::async_trait;
use ca_core::{Event, RemoteConfig, RemoteEventSource, RemoteSession, SourceResult, TimeWindow};
use quick_xml::Reader;
use quick_xml::events::Event as XmlEvent;
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::error::{CalendarError, Result};
use crate::ical::parse_vevents;

/// Calendar id used when none is configured
pub const DEFAULT_CALENDAR_ID: &str = "primary";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// CalDAV account configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CalDavConfig {
    /// CalDAV server URL
    pub server_url: String,
    /// Username for authentication
    pub username: String,
    /// Password for authentication
    pub password: String,
    /// Calendar ID (optional, defaults to primary calendar)
    #[serde(default)]
    pub calendar_id: Option<String>,
}

impl CalDavConfig {
    pub fn new(
        server_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            username: username.into(),
            password: password.into(),
            calendar_id: None,
        }
    }

    /// Set the calendar ID
    pub fn with_calendar_id(mut self, calendar_id: impl Into<String>) -> Self {
        self.calendar_id = Some(calendar_id.into());
        self
    }

    /// Build from the `[remote]` section, if a server and user are set
    pub fn from_remote(remote: &RemoteConfig) -> Option<Self> {
        if !remote.is_configured() {
            return None;
        }
        let mut config = Self::new(
            remote.server_url.clone()?,
            remote.username.clone()?,
            remote.password.clone().unwrap_or_default(),
        );
        config.calendar_id = remote.calendar_id.clone();
        Some(config)
    }

    pub fn calendar_id(&self) -> &str {
        self.calendar_id.as_deref().unwrap_or(DEFAULT_CALENDAR_ID)
    }
}

/// Reads timed events from one CalDAV calendar
pub struct CalDavSource {
    client: Client,
    config: CalDavConfig,
    base_url: String,
}

impl CalDavSource {
    pub fn new(config: CalDavConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CalendarError::Configuration(e.to_string()))?;

        let base_url = config.server_url.trim_end_matches('/').to_string();
        info!("CalDAV source initialized for: {}", base_url);

        Ok(Self {
            client,
            config,
            base_url,
        })
    }

    pub fn config(&self) -> &CalDavConfig {
        &self.config
    }

    fn calendar_url(&self) -> String {
        format!("{}/{}", self.base_url, self.config.calendar_id())
    }

    /// Fetch timed events starting inside `window`
    ///
    /// The server expands recurring events into single instances, each
    /// identified by its `RECURRENCE-ID`. All-day events are skipped.
    pub async fn get_events(&self, window: &TimeWindow) -> Result<Vec<Event>> {
        let url = self.calendar_url();
        let body = calendar_query(window);
        let report = Method::from_bytes(b"REPORT")
            .map_err(|e| CalendarError::Configuration(e.to_string()))?;

        debug!("Fetching events from: {}", url);

        let response = self
            .client
            .request(report, &url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .header("Content-Type", "application/xml; charset=utf-8")
            .header("Depth", "1")
            .body(body)
            .send()
            .await
            .map_err(|e| CalendarError::Connection(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("CalDAV request failed: {} - {}", status, error_text);
            return Err(status_error(status, &error_text));
        }

        let text = response
            .text()
            .await
            .map_err(|e| CalendarError::Connection(e.to_string()))?;

        let calendar_id = self.config.calendar_id();
        let mut events: Vec<Event> = parse_calendar_data(&text)?
            .iter()
            .flat_map(|ical| parse_vevents(ical))
            .filter_map(|v| v.to_event(calendar_id, false))
            .filter(|e| window.contains(e.start))
            .collect();
        events.sort_by(|a, b| a.start.cmp(&b.start));

        info!("Fetched {} events", events.len());
        Ok(events)
    }
}

#[async_trait]
impl RemoteEventSource for CalDavSource {
    fn session(&self) -> Option<RemoteSession> {
        (!self.config.username.is_empty()).then(|| RemoteSession::new(&self.config.username))
    }

    async fn fetch_remote_events(
        &self,
        _session: &RemoteSession,
        window: &TimeWindow,
    ) -> SourceResult<Vec<Event>> {
        Ok(self.get_events(window).await?)
    }
}

fn calendar_query(window: &TimeWindow) -> String {
    let start_str = window.start.format("%Y%m%dT%H%M%SZ");
    let end_str = window.end.format("%Y%m%dT%H%M%SZ");

    format!(
        r#"<?xml version="1.0" encoding="utf-8" ?>
<C:calendar-query xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
    <D:prop>
        <D:getetag/>
        <C:calendar-data>
            <C:expand start="{start}" end="{end}"/>
        </C:calendar-data>
    </D:prop>
    <C:filter>
        <C:comp-filter name="VCALENDAR">
            <C:comp-filter name="VEVENT">
                <C:time-range start="{start}" end="{end}"/>
            </C:comp-filter>
        </C:comp-filter>
    </C:filter>
</C:calendar-query>"#,
        start = start_str,
        end = end_str
    )
}

fn status_error(status: StatusCode, body: &str) -> CalendarError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            CalendarError::Authentication(format!("Request rejected: {}", status))
        }
        _ => CalendarError::CaldavError(format!("Request failed: {} - {}", status, body)),
    }
}

/// Extract every `calendar-data` payload from a multistatus response
fn parse_calendar_data(response: &str) -> Result<Vec<String>> {
    let mut reader = Reader::from_str(response);
    reader.config_mut().trim_text(true);

    let mut payloads = Vec::new();
    let mut buf = Vec::new();
    let mut current: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(XmlEvent::Start(ref e)) if e.local_name().as_ref() == b"calendar-data" => {
                current = Some(String::new());
            }
            Ok(XmlEvent::End(ref e)) if e.local_name().as_ref() == b"calendar-data" => {
                payloads.extend(current.take());
            }
            Ok(XmlEvent::Text(ref e)) => {
                if let Some(data) = current.as_mut() {
                    let text = e
                        .unescape()
                        .map_err(|e| CalendarError::XmlParseError(e.to_string()))?;
                    data.push_str(&text);
                }
            }
            Ok(XmlEvent::CData(ref e)) => {
                if let Some(data) = current.as_mut() {
                    data.push_str(&String::from_utf8_lossy(e));
                }
            }
            Ok(XmlEvent::Eof) => break,
            Err(e) => {
                return Err(CalendarError::XmlParseError(e.to_string()));
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(payloads)
}

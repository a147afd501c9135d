//! ca-calendar: Calendar event sources for ca-gateway
//!
//! ## Features
//!
//! - `.ics` directory source for local calendars
//! - CalDAV source for a remote account
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ca_calendar::{CalDavConfig, CalDavSource, IcsDirectorySource};
//!
//! let local = IcsDirectorySource::new("calendars");
//! let remote = CalDavSource::new(
//!     CalDavConfig::new("https://caldav.example.com", "user", "password")
//!         .with_calendar_id("work"),
//! )?;
//! ```

pub mod caldav;
pub mod error;
pub mod ical;
pub mod ics;

pub use caldav::{CalDavConfig, CalDavSource, DEFAULT_CALENDAR_ID};
pub use error::{CalendarError, Result};
pub use ics::IcsDirectorySource;

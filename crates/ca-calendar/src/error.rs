//! Error types for ca-calendar

use ca_core::SourceError;
use thiserror::Error;

/// ca-calendar error type
#[derive(Error, Debug)]
pub enum CalendarError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("CalDAV error: {0}")]
    CaldavError(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("XML parsing error: {0}")]
    XmlParseError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, CalendarError>;

impl From<CalendarError> for SourceError {
    fn from(err: CalendarError) -> Self {
        match err {
            CalendarError::AccessDenied(msg) => SourceError::PermissionDenied(msg),
            CalendarError::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                SourceError::PermissionDenied(e.to_string())
            }
            CalendarError::Io(e) => SourceError::Io(e),
            CalendarError::Authentication(msg) => SourceError::AuthExpired(msg),
            CalendarError::Configuration(msg)
            | CalendarError::Connection(msg)
            | CalendarError::CaldavError(msg) => SourceError::NetworkError(msg),
            CalendarError::XmlParseError(msg) | CalendarError::ParseError(msg) => {
                SourceError::Parse(msg)
            }
        }
    }
}

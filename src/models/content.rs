//! Crawled content models.

use chrono::{DateTime, Utc};

/// A crawled copy of a URL. Multiple rows per URL are allowed; archived
/// replays carry the archive timestamp in `crawltime`.
#[derive(Debug, Clone)]
pub struct ContentRow {
    pub id: i64,
    pub url_id: i64,
    pub crawltime: DateTime<Utc>,
    pub archived: bool,
    /// HTTP response status.
    pub response: u16,
    /// Content type as reported by the server.
    pub content_type: String,
    pub content: String,
}

/// What to do with a content body larger than the configured maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OversizePolicy {
    /// Cut the body down to the maximum (at a character boundary).
    Trim,
    /// Store an empty body.
    Empty,
    /// Store NULL.
    Null,
    /// Reject the insertion.
    #[default]
    Error,
}

impl OversizePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trim => "trim",
            Self::Empty => "empty",
            Self::Null => "null",
            Self::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "trim" => Some(Self::Trim),
            "empty" => Some(Self::Empty),
            "null" => Some(Self::Null),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

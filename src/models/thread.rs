//! Worker-thread models.
//!
//! A thread row exists for every registered worker (running, paused, or
//! interrupted-but-resumable). The `last` cursor is the highest URL id the
//! worker has finished durably; it is monotone within a run.

use serde::{Deserialize, Serialize};

/// The module a worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    Crawler,
    Parser,
    Extractor,
    Analyzer,
}

impl ModuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crawler => "crawler",
            Self::Parser => "parser",
            Self::Extractor => "extractor",
            Self::Analyzer => "analyzer",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "crawler" => Some(Self::Crawler),
            "parser" => Some(Self::Parser),
            "extractor" => Some(Self::Extractor),
            "analyzer" => Some(Self::Analyzer),
            _ => None,
        }
    }

    /// Suffix of the per-list lock table this module coordinates through.
    pub fn lock_suffix(&self) -> &'static str {
        match self {
            Self::Crawler => "crawling",
            Self::Parser => "parsing",
            Self::Extractor => "extracting",
            Self::Analyzer => "analyzing",
        }
    }

    /// Target-table infix for modules that write output tables.
    pub fn target_infix(&self) -> Option<&'static str> {
        match self {
            Self::Crawler => None,
            Self::Parser => Some("parsed"),
            Self::Extractor => Some("extracted"),
            Self::Analyzer => Some("analyzed"),
        }
    }
}

/// A persisted worker-thread row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadEntry {
    pub id: i64,
    pub module: ModuleKind,
    /// Last status message; prefixed `{PAUSED}` while paused.
    pub status: String,
    pub paused: bool,
    pub website: i64,
    pub urllist: i64,
    pub config: i64,
    /// Progress cursor (highest durably finished URL id).
    pub last: i64,
    /// Fractional progress (0.0 ..= 1.0) reported by the module.
    pub progress: f64,
    /// Accumulated run time in seconds.
    pub runtime: u64,
    /// Accumulated pause time in seconds.
    pub pausetime: u64,
}

/// Properties binding a new worker to its targets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThreadProps {
    pub module: ModuleKind,
    pub website: i64,
    pub urllist: i64,
    pub config: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_round_trip() {
        for kind in [
            ModuleKind::Crawler,
            ModuleKind::Parser,
            ModuleKind::Extractor,
            ModuleKind::Analyzer,
        ] {
            assert_eq!(ModuleKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(ModuleKind::from_str("indexer"), None);
    }

    #[test]
    fn test_lock_suffixes() {
        assert_eq!(ModuleKind::Crawler.lock_suffix(), "crawling");
        assert_eq!(ModuleKind::Parser.lock_suffix(), "parsing");
        assert_eq!(ModuleKind::Crawler.target_infix(), None);
        assert_eq!(ModuleKind::Analyzer.target_infix(), Some("analyzed"));
    }
}

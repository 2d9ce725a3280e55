//! Crawler configuration, deserialized from the stored JSON blob.

use serde::{Deserialize, Serialize};

use crate::net::NetworkConfig;

pub const LOGGING_SILENT: u8 = 0;
pub const LOGGING_DEFAULT: u8 = 1;
pub const LOGGING_EXTENDED: u8 = 2;
pub const LOGGING_VERBOSE: u8 = 3;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    pub crawler: CrawlerSection,
    pub custom: CustomSection,
    pub network: NetworkConfig,
}

impl CrawlerConfig {
    pub fn parse(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerSection {
    /// Fetch archived copies via the Memento protocol.
    pub archives: bool,
    #[serde(rename = "archives.names")]
    pub archives_names: Vec<String>,
    #[serde(rename = "archives.urls.memento")]
    pub archives_urls_memento: Vec<String>,
    #[serde(rename = "archives.urls.timemap")]
    pub archives_urls_timemap: Vec<String>,
    /// URL lock duration in seconds.
    pub lock: u64,
    /// 0 = silent, 1 = default, 2 = extended, 3 = verbose.
    pub logging: u8,
    /// Query-string parameters that exclude a discovered link.
    #[serde(rename = "params.blacklist")]
    pub params_blacklist: Vec<String>,
    /// When non-empty, discovered links may only carry these parameters.
    #[serde(rename = "params.whitelist")]
    pub params_whitelist: Vec<String>,
    #[serde(rename = "queries.blacklist.content")]
    pub queries_blacklist_content: Vec<i64>,
    #[serde(rename = "queries.blacklist.types")]
    pub queries_blacklist_types: Vec<i64>,
    #[serde(rename = "queries.blacklist.urls")]
    pub queries_blacklist_urls: Vec<i64>,
    /// Canonical-URL query; a differing canonical skips the URL.
    #[serde(rename = "queries.canonical")]
    pub queries_canonical: Option<i64>,
    /// Link-extraction queries.
    #[serde(rename = "queries.links")]
    pub queries_links: Vec<i64>,
    #[serde(rename = "queries.whitelist.content")]
    pub queries_whitelist_content: Vec<i64>,
    #[serde(rename = "queries.whitelist.types")]
    pub queries_whitelist_types: Vec<i64>,
    #[serde(rename = "queries.whitelist.urls")]
    pub queries_whitelist_urls: Vec<i64>,
    /// Ignore the success flag when selecting URLs.
    pub recrawl: bool,
    /// URLs always re-crawled regardless of status.
    #[serde(rename = "recrawl.always")]
    pub recrawl_always: Vec<String>,
    /// Re-crawl the start page on every run.
    #[serde(rename = "recrawl.start")]
    pub recrawl_start: bool,
    /// HTTP statuses treated as success besides 2xx.
    #[serde(rename = "response.aliases")]
    pub response_aliases: Vec<u16>,
    /// Retries per URL; negative means retry indefinitely.
    pub retries: i64,
    /// Retry failed archive fetches.
    #[serde(rename = "retry.archive")]
    pub retry_archive: bool,
    /// HTTP statuses that schedule a retry.
    #[serde(rename = "retry.http")]
    pub retry_http: Vec<u16>,
    /// Milliseconds to sleep after a retriable error.
    #[serde(rename = "sleep.error")]
    pub sleep_error: u64,
    /// Milliseconds between HTTP requests (0 = none).
    #[serde(rename = "sleep.http")]
    pub sleep_http: u64,
    /// Milliseconds to sleep when no URL is available.
    #[serde(rename = "sleep.idle")]
    pub sleep_idle: u64,
    /// Start page (sub-URL for domain-scoped lists).
    pub start: String,
}

impl Default for CrawlerSection {
    fn default() -> Self {
        Self {
            archives: false,
            archives_names: vec!["archives.org".to_string()],
            archives_urls_memento: vec!["http://web.archive.org/web/".to_string()],
            archives_urls_timemap: vec![
                "http://web.archive.org/web/timemap/link/".to_string()
            ],
            lock: 300,
            logging: LOGGING_DEFAULT,
            params_blacklist: Vec::new(),
            params_whitelist: Vec::new(),
            queries_blacklist_content: Vec::new(),
            queries_blacklist_types: Vec::new(),
            queries_blacklist_urls: Vec::new(),
            queries_canonical: None,
            queries_links: Vec::new(),
            queries_whitelist_content: Vec::new(),
            queries_whitelist_types: Vec::new(),
            queries_whitelist_urls: Vec::new(),
            recrawl: false,
            recrawl_always: Vec::new(),
            recrawl_start: false,
            response_aliases: Vec::new(),
            retries: 5,
            retry_archive: true,
            retry_http: vec![408, 429, 500, 502, 503, 504],
            sleep_error: 5000,
            sleep_http: 0,
            sleep_idle: 5000,
            start: "/".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomSection {
    /// Counter variable names, substituted verbatim in custom URLs.
    pub counters: Vec<String>,
    #[serde(rename = "counters.end")]
    pub counters_end: Vec<i64>,
    /// One shared counter across all custom URLs instead of per-URL
    /// expansion.
    #[serde(rename = "counters.global")]
    pub counters_global: bool,
    #[serde(rename = "counters.start")]
    pub counters_start: Vec<i64>,
    #[serde(rename = "counters.step")]
    pub counters_step: Vec<i64>,
    /// Re-crawl custom URLs on every run.
    pub recrawl: bool,
    /// Operator-supplied seed URLs.
    pub urls: Vec<String>,
}

impl Default for CustomSection {
    fn default() -> Self {
        Self {
            counters: Vec::new(),
            counters_end: Vec::new(),
            counters_global: true,
            counters_start: Vec::new(),
            counters_step: Vec::new(),
            recrawl: false,
            urls: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CrawlerConfig::parse("{}").unwrap();
        assert_eq!(config.crawler.lock, 300);
        assert_eq!(config.crawler.sleep_idle, 5000);
        assert!(!config.crawler.recrawl);
        assert!(config.crawler.retry_http.contains(&503));
        assert_eq!(config.crawler.start, "/");
        assert!(config.custom.counters_global);
    }

    #[test]
    fn test_dotted_keys() {
        let json = r#"{
            "crawler": {
                "queries.links": [3, 4],
                "recrawl.always": ["/feed"],
                "retry.http": [429],
                "sleep.http": 250,
                "params.blacklist": ["session"]
            },
            "custom": {
                "urls": ["/page/$(n)$"],
                "counters": ["$(n)$"],
                "counters.start": [1],
                "counters.end": [3],
                "counters.step": [1]
            },
            "network": {"useragent": "bot"}
        }"#;
        let config = CrawlerConfig::parse(json).unwrap();
        assert_eq!(config.crawler.queries_links, vec![3, 4]);
        assert_eq!(config.crawler.recrawl_always, vec!["/feed"]);
        assert_eq!(config.crawler.retry_http, vec![429]);
        assert_eq!(config.crawler.sleep_http, 250);
        assert_eq!(config.custom.urls, vec!["/page/$(n)$"]);
        assert_eq!(config.network.useragent.as_deref(), Some("bot"));
    }

    #[test]
    fn test_unknown_keys_tolerated() {
        let config = CrawlerConfig::parse(r#"{"crawler": {"timing": true}}"#).unwrap();
        assert_eq!(config.crawler.lock, 300);
    }
}

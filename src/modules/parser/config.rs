//! Parser configuration. The extractor uses the same schema against its
//! own lock and target tables.

use serde::{Deserialize, Serialize};

/// Where a query reads its input from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuerySource {
    Url,
    #[default]
    Content,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    pub general: GeneralSection,
    pub parser: ParserSection,
}

impl ParserConfig {
    pub fn parse(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSection {
    /// URL lock duration in seconds.
    pub lock: u64,
    /// 0 = silent, 1 = default, 2 = extended, 3 = verbose.
    pub logging: u8,
    /// Only the latest non-archived content row, or all content rows.
    #[serde(rename = "newest.only")]
    pub newest_only: bool,
    /// Include operator-inserted URLs.
    #[serde(rename = "parse.custom")]
    pub parse_custom: bool,
    /// Ignore the success flag when selecting URLs.
    pub reparse: bool,
    /// Target table name (provisioned on start).
    #[serde(rename = "result.table")]
    pub result_table: String,
    /// Milliseconds to sleep when no URL is available.
    #[serde(rename = "sleep.idle")]
    pub sleep_idle: u64,
}

impl Default for GeneralSection {
    fn default() -> Self {
        Self {
            lock: 300,
            logging: 1,
            newest_only: true,
            parse_custom: false,
            reparse: false,
            result_table: String::new(),
            sleep_idle: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserSection {
    /// Queries producing the row id, tried in order.
    #[serde(rename = "id.queries")]
    pub id_queries: Vec<i64>,
    #[serde(rename = "id.sources")]
    pub id_sources: Vec<QuerySource>,
    /// Parsed ids to discard.
    #[serde(rename = "id.ignore")]
    pub id_ignore: Vec<String>,
    /// Fallback regex over the URL when no id query matched.
    #[serde(rename = "id.from.url")]
    pub id_from_url: Option<String>,

    #[serde(rename = "datetime.queries")]
    pub datetime_queries: Vec<i64>,
    #[serde(rename = "datetime.sources")]
    pub datetime_sources: Vec<QuerySource>,
    /// Format paired with each datetime query.
    #[serde(rename = "datetime.formats")]
    pub datetime_formats: Vec<String>,
    /// Locale paired with each datetime query.
    #[serde(rename = "datetime.locales")]
    pub datetime_locales: Vec<String>,

    #[serde(rename = "field.names")]
    pub field_names: Vec<String>,
    #[serde(rename = "field.queries")]
    pub field_queries: Vec<i64>,
    #[serde(rename = "field.sources")]
    pub field_sources: Vec<QuerySource>,
    /// Join delimiter per field, with `\n`, `\t`, `\\` escapes.
    #[serde(rename = "field.delimiters")]
    pub field_delimiters: Vec<String>,
    /// Drop empty values from multi-result fields.
    #[serde(rename = "field.ignore.empty")]
    pub field_ignore_empty: Vec<bool>,
    /// Emit the field as a JSON array instead of a joined string.
    #[serde(rename = "field.json")]
    pub field_json: Vec<bool>,
    /// Collapse whitespace in values.
    #[serde(rename = "field.tidy.texts")]
    pub field_tidy_texts: Vec<bool>,
    /// Log when the field comes up empty.
    #[serde(rename = "field.warnings.empty")]
    pub field_warnings_empty: Vec<bool>,
}

impl Default for ParserSection {
    fn default() -> Self {
        Self {
            id_queries: Vec::new(),
            id_sources: Vec::new(),
            id_ignore: Vec::new(),
            id_from_url: None,
            datetime_queries: Vec::new(),
            datetime_sources: Vec::new(),
            datetime_formats: Vec::new(),
            datetime_locales: Vec::new(),
            field_names: Vec::new(),
            field_queries: Vec::new(),
            field_sources: Vec::new(),
            field_delimiters: Vec::new(),
            field_ignore_empty: Vec::new(),
            field_json: Vec::new(),
            field_tidy_texts: Vec::new(),
            field_warnings_empty: Vec::new(),
        }
    }
}

/// Default datetime parse format.
pub const DEFAULT_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ParserConfig::parse("{}").unwrap();
        assert!(config.general.newest_only);
        assert!(!config.general.reparse);
        assert_eq!(config.general.lock, 300);
        assert!(config.parser.id_queries.is_empty());
    }

    #[test]
    fn test_dotted_keys_and_sources() {
        let json = r#"{
            "general": {"result.table": "articles", "newest.only": false},
            "parser": {
                "id.queries": [1],
                "id.sources": ["content"],
                "id.ignore": ["0"],
                "datetime.queries": [2],
                "datetime.formats": ["%d.%m.%Y"],
                "field.names": ["title", "tags"],
                "field.queries": [3, 4],
                "field.sources": ["content", "url"],
                "field.delimiters": [",", "\\n"],
                "field.json": [false, true]
            }
        }"#;
        let config = ParserConfig::parse(json).unwrap();
        assert_eq!(config.general.result_table, "articles");
        assert!(!config.general.newest_only);
        assert_eq!(config.parser.id_sources, vec![QuerySource::Content]);
        assert_eq!(
            config.parser.field_sources,
            vec![QuerySource::Content, QuerySource::Url]
        );
        assert_eq!(config.parser.field_json, vec![false, true]);
    }
}

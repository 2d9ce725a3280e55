//! Analyzer configuration.

use serde::{Deserialize, Serialize};

/// Which table family an input table comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputSource {
    /// Parser output (`parsed_` target tables).
    #[default]
    Parsing,
    /// Extractor output (`extracted_` target tables).
    Extracting,
    /// Another analyzer's output (`analyzed_` target tables).
    Analyzing,
    /// The list's crawled-content table.
    Crawling,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub general: GeneralSection,
    pub markov: MarkovSection,
}

impl AnalyzerConfig {
    pub fn parse(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSection {
    /// 0 = silent, 1 = default, 2 = extended, 3 = verbose.
    pub logging: u8,
    /// Source tables (names as registered, e.g. parser output).
    #[serde(rename = "input.tables")]
    pub input_tables: Vec<String>,
    /// Table family of each input table; missing entries default to
    /// parser output.
    #[serde(rename = "input.sources")]
    pub input_sources: Vec<InputSource>,
    /// Column read from each input table; each row becomes one corpus.
    #[serde(rename = "input.fields")]
    pub input_fields: Vec<String>,
    /// Result table name (provisioned on start).
    #[serde(rename = "result.table")]
    pub result_table: String,
    /// Column the generated sentences are written to.
    #[serde(rename = "result.field")]
    pub result_field: String,
    /// Milliseconds to sleep when there is no corpus yet.
    #[serde(rename = "sleep.idle")]
    pub sleep_idle: u64,
}

impl Default for GeneralSection {
    fn default() -> Self {
        Self {
            logging: 1,
            input_tables: Vec::new(),
            input_sources: Vec::new(),
            input_fields: Vec::new(),
            result_table: String::new(),
            result_field: "sentence".to_string(),
            sleep_idle: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkovSection {
    /// Maximum k-gram order.
    pub dimension: usize,
    /// Target sentence length in bytes.
    pub length: usize,
    /// Sentences generated per tick.
    pub max: u64,
    /// Minimum distinct corpora that must contribute to a sentence.
    #[serde(rename = "min.corpora")]
    pub min_corpora: usize,
    /// Milliseconds to sleep between generation batches.
    pub sleep: u64,
    /// Enable the spell-correction seam during tokenization.
    pub spellcheck: bool,
    /// Emoticon list file, relative to the website data directory.
    #[serde(rename = "emoticons.file")]
    pub emoticons_file: Option<String>,
}

impl Default for MarkovSection {
    fn default() -> Self {
        Self {
            dimension: 5,
            length: 400,
            max: 1,
            min_corpora: 1,
            sleep: 10_000,
            spellcheck: false,
            emoticons_file: None,
        }
    }
}

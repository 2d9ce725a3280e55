//! Parser module, also instantiated as the extractor.
//!
//! Per URL: select content, run the id, datetime, and field queries, write
//! one row into the target table keyed by URL id, then mark the URL
//! successful. The write-then-mark order means a crash can cause a
//! re-parse and re-upsert, never a lost success. The extractor runs the
//! identical pipeline against the extracting lock table and `extracted_`
//! target tables.

mod config;

pub use config::{ParserConfig, QuerySource};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;

use crate::models::{ContentRow, ModuleKind, UrlRow};
use crate::queries::{CompiledQuery, HtmlDocument};
use crate::repository::{
    crawled_table, lock_named, ContentRepository, TargetColumn, TargetTableRepository,
    UrlListEngine,
};
use crate::supervisor::{WorkerEnv, WorkerError, WorkerModule, WorkerResult};
use crate::utils::text::{parse_delimiter, tidy_whitespace};

use config::DEFAULT_DATETIME_FORMAT;

struct DatetimeQuery {
    query: CompiledQuery,
    source: QuerySource,
    format: String,
    locale: Option<String>,
}

struct FieldQuery {
    name: String,
    query: CompiledQuery,
    source: QuerySource,
    delimiter: char,
    ignore_empty: bool,
    json: bool,
    tidy: bool,
    warn_empty: bool,
}

struct ParserState {
    config: ParserConfig,
    engine: UrlListEngine,
    contents: ContentRepository,
    targets: TargetTableRepository,
    target_table: String,
    id_column: String,
    datetime_column: String,
    id_queries: Vec<(CompiledQuery, QuerySource)>,
    datetime_queries: Vec<DatetimeQuery>,
    field_queries: Vec<FieldQuery>,
    id_from_url: Option<Regex>,
    crawled: String,
}

/// The extracted values for one URL.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ParsedRow {
    parsed_id: String,
    datetime: Option<String>,
    fields: Vec<(String, Option<String>)>,
}

pub struct ParserModule {
    env: Arc<WorkerEnv>,
    kind: ModuleKind,
    state: Option<ParserState>,
}

impl ParserModule {
    pub fn new(env: Arc<WorkerEnv>, kind: ModuleKind) -> Self {
        Self {
            env,
            kind,
            state: None,
        }
    }
}

#[async_trait]
impl WorkerModule for ParserModule {
    async fn on_init(&mut self, resumed: bool) -> WorkerResult<()> {
        let env = &self.env;
        env.set_status("initializing");

        let config = ParserConfig::parse(&env.config_json)
            .map_err(|e| WorkerError::Config(format!("cannot parse configuration: {e}")))?;

        if config.general.result_table.is_empty() {
            return Err(WorkerError::Config("general.result.table is not set".to_string()));
        }

        let Some(infix) = self.kind.target_infix() else {
            return Err(WorkerError::Config(format!(
                "{} cannot run the parser pipeline",
                self.kind.as_str()
            )));
        };
        let id_column = format!("{infix}_id");
        let datetime_column = format!("{infix}_datetime");

        let engine = UrlListEngine::new(
            env.db.clone(),
            &env.website.namespace,
            &env.list.namespace,
        );
        let contents =
            ContentRepository::new(env.db.clone(), &env.website.namespace, &env.list.namespace);
        let targets = TargetTableRepository::new(env.db.clone());

        // Target-table provisioning is serialized per (type, website, list).
        let mut columns = vec![
            TargetColumn::new(&id_column, "TEXT"),
            TargetColumn::new(&datetime_column, "TEXT"),
        ];
        for name in &config.parser.field_names {
            columns.push(TargetColumn::new(name, "TEXT"));
        }

        let lock_name = format!(
            "targetlock.{infix}.{}.{}",
            env.website.id, env.list.id
        );
        let control = env.control.clone();
        let guard = lock_named(&lock_name, move || control.is_running());
        if guard.is_none() {
            return Err(WorkerError::Config("stopped while waiting for table lock".to_string()));
        }
        let (_, target_table) = targets.add_or_get(
            self.kind,
            env.website.id,
            env.list.id,
            &env.website.namespace,
            &env.list.namespace,
            &config.general.result_table,
            &columns,
            false,
        )?;
        drop(guard);

        // Zip queries with their sources and per-field options; missing
        // array entries fall back to defaults.
        let mut id_queries = Vec::new();
        for (i, &query_id) in config.parser.id_queries.iter().enumerate() {
            let source = config.parser.id_sources.get(i).copied().unwrap_or_default();
            for query in super::load_queries(&env.db, env.website.id, &[query_id])? {
                id_queries.push((query, source));
            }
        }

        let mut datetime_queries = Vec::new();
        for (i, &query_id) in config.parser.datetime_queries.iter().enumerate() {
            let source = config
                .parser
                .datetime_sources
                .get(i)
                .copied()
                .unwrap_or_default();
            let format = config
                .parser
                .datetime_formats
                .get(i)
                .cloned()
                .filter(|f| !f.is_empty())
                .unwrap_or_else(|| DEFAULT_DATETIME_FORMAT.to_string());
            let locale = config.parser.datetime_locales.get(i).cloned();
            if let Some(locale) = &locale {
                if !locale.is_empty() && !locale.starts_with("en") {
                    env.log(&format!(
                        "datetime locale '{locale}' is not supported; using untranslated parsing"
                    ));
                }
            }
            for query in super::load_queries(&env.db, env.website.id, &[query_id])? {
                datetime_queries.push(DatetimeQuery {
                    query,
                    source,
                    format: format.clone(),
                    locale: locale.clone(),
                });
            }
        }

        let mut field_queries = Vec::new();
        for (i, name) in config.parser.field_names.iter().enumerate() {
            let Some(&query_id) = config.parser.field_queries.get(i) else {
                return Err(WorkerError::Config(format!("field '{name}' has no query")));
            };
            let source = config
                .parser
                .field_sources
                .get(i)
                .copied()
                .unwrap_or_default();
            let delimiter = config
                .parser
                .field_delimiters
                .get(i)
                .map(|spec| {
                    parse_delimiter(spec).ok_or_else(|| {
                        WorkerError::Config(format!("invalid delimiter '{spec}' for field '{name}'"))
                    })
                })
                .transpose()?
                .unwrap_or('\n');
            for query in super::load_queries(&env.db, env.website.id, &[query_id])? {
                field_queries.push(FieldQuery {
                    name: name.clone(),
                    query,
                    source,
                    delimiter,
                    ignore_empty: get_flag(&config.parser.field_ignore_empty, i, true),
                    json: get_flag(&config.parser.field_json, i, false),
                    tidy: get_flag(&config.parser.field_tidy_texts, i, false),
                    warn_empty: get_flag(&config.parser.field_warnings_empty, i, false),
                });
            }
        }

        let id_from_url = config
            .parser
            .id_from_url
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(Regex::new)
            .transpose()
            .map_err(|e| WorkerError::Config(format!("invalid id.from.url pattern: {e}")))?;

        if resumed {
            env.log("resuming after interruption");
        }
        env.set_status("ready");

        self.state = Some(ParserState {
            crawled: crawled_table(&env.website.namespace, &env.list.namespace),
            config,
            engine,
            contents,
            targets,
            target_table,
            id_column,
            datetime_column,
            id_queries,
            datetime_queries,
            field_queries,
            id_from_url,
        });
        Ok(())
    }

    async fn on_tick(&mut self) -> WorkerResult<()> {
        let env = self.env.clone();
        let kind = self.kind;
        let Some(state) = self.state.as_mut() else {
            return Err(WorkerError::Config("parser not initialized".to_string()));
        };
        state.tick(&env, kind).await
    }

    async fn on_pause(&mut self) {}

    async fn on_unpause(&mut self) {}

    async fn on_clear(&mut self, _interrupted: bool) {
        self.state = None;
    }
}

fn get_flag(flags: &[bool], index: usize, default: bool) -> bool {
    flags.get(index).copied().unwrap_or(default)
}

impl ParserState {
    async fn tick(&mut self, env: &WorkerEnv, kind: ModuleKind) -> WorkerResult<()> {
        // Only URLs with crawled content are eligible.
        let Some(url) = self.engine.next_for_with_content(
            kind,
            env.last(),
            self.config.general.reparse,
            self.config.general.parse_custom,
            &self.crawled,
        )?
        else {
            env.set_status("idle");
            env.set_progress(1.0);
            env.sleep(Duration::from_millis(self.config.general.sleep_idle))
                .await;
            return Ok(());
        };

        let Some(lock) = self
            .engine
            .lock(url.id, kind, self.config.general.lock)?
        else {
            return Ok(());
        };

        env.set_status(&format!("processing {}", url.url));
        if let (Ok(position), Ok(total)) =
            (self.engine.position_of(url.id), self.engine.count())
        {
            if total > 0 {
                env.set_progress(position as f32 / total as f32);
            }
        }

        let rows = if self.config.general.newest_only {
            self.contents.latest(url.id)?.into_iter().collect()
        } else {
            self.contents.all(url.id)?
        };

        let mut written = false;
        for content in &rows {
            match self.parse_content(&url, content) {
                Ok(Some(row)) => {
                    let mut values = vec![
                        (self.id_column.clone(), Some(row.parsed_id.clone())),
                        (self.datetime_column.clone(), row.datetime.clone()),
                    ];
                    values.extend(row.fields.clone());
                    self.targets.upsert_row(&self.target_table, url.id, &values)?;
                    written = true;
                }
                Ok(None) => {}
                Err(warning) => {
                    if self.config.general.logging > 0 {
                        env.log(&format!("{}: {warning}", url.url));
                    }
                }
            }
        }

        if !written && self.config.general.logging > 1 {
            env.log(&format!("no row produced for {}", url.url));
        }

        // The success mark is the commit point; the upsert above may run
        // again after a crash without harm.
        if self.engine.mark_success(url.id, kind, &lock)? {
            env.set_last(url.id)?;
        }

        Ok(())
    }

    /// Run the query pipeline over one content row.
    ///
    /// `Ok(None)` means the row is deliberately not parsed (ignored id);
    /// `Err` carries a warning for the operator log.
    fn parse_content(
        &self,
        url: &UrlRow,
        content: &ContentRow,
    ) -> std::result::Result<Option<ParsedRow>, String> {
        let doc = HtmlDocument::parse(&content.content);

        let parsed_id = self.extract_id(&doc, url, &content.content)?;
        if self.config.parser.id_ignore.iter().any(|i| i == &parsed_id) {
            return Ok(None);
        }

        let datetime = self.extract_datetime(&doc, url, &content.content);

        let mut fields = Vec::with_capacity(self.field_queries.len());
        for field in &self.field_queries {
            fields.push((field.name.clone(), self.extract_field(field, &doc, url, content)));
        }

        Ok(Some(ParsedRow {
            parsed_id,
            datetime,
            fields,
        }))
    }

    fn source_text<'a>(source: QuerySource, url: &'a UrlRow, content: &'a str) -> &'a str {
        match source {
            QuerySource::Url => &url.url,
            QuerySource::Content => content,
        }
    }

    fn extract_id(
        &self,
        doc: &HtmlDocument,
        url: &UrlRow,
        content: &str,
    ) -> std::result::Result<String, String> {
        for (query, source) in &self.id_queries {
            let text = Self::source_text(*source, url, content);
            if let Some(value) = query.first(doc, text) {
                if !value.is_empty() {
                    return Ok(value);
                }
            }
        }

        if let Some(pattern) = &self.id_from_url {
            if let Some(caps) = pattern.captures(&url.url) {
                let value = caps
                    .get(1)
                    .or_else(|| caps.get(0))
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default();
                if !value.is_empty() {
                    return Ok(value);
                }
            }
        }

        Err("no id could be extracted".to_string())
    }

    fn extract_datetime(&self, doc: &HtmlDocument, url: &UrlRow, content: &str) -> Option<String> {
        for dt in &self.datetime_queries {
            let text = Self::source_text(dt.source, url, content);
            let Some(value) = dt.query.first(doc, text) else {
                continue;
            };
            let value = tidy_whitespace(&value);
            if value.is_empty() {
                continue;
            }
            if let Some(parsed) = parse_datetime_value(&value, &dt.format) {
                return Some(parsed);
            }
            tracing::debug!(
                "datetime '{value}' does not match format '{}' (locale {:?})",
                dt.format,
                dt.locale
            );
        }
        None
    }

    fn extract_field(
        &self,
        field: &FieldQuery,
        doc: &HtmlDocument,
        url: &UrlRow,
        content: &ContentRow,
    ) -> Option<String> {
        let text = Self::source_text(field.source, url, &content.content);

        let mut values = if field.query.result_multi {
            field.query.all(doc, text)
        } else {
            field.query.first(doc, text).into_iter().collect()
        };

        if field.tidy {
            values = values.iter().map(|v| tidy_whitespace(v)).collect();
        }
        if field.ignore_empty {
            values.retain(|v| !v.is_empty());
        }

        if values.is_empty() {
            if field.warn_empty {
                tracing::warn!("field '{}' is empty for URL {}", field.name, url.url);
            }
            return None;
        }

        if field.json {
            serde_json::to_string(&values).ok()
        } else {
            Some(values.join(&field.delimiter.to_string()))
        }
    }
}

/// Parse a datetime value into the ISO 8601 form stored in target tables.
/// Date-only formats yield midnight.
fn parse_datetime_value(value: &str, format: &str) -> Option<String> {
    if let Ok(datetime) = NaiveDateTime::parse_from_str(value, format) {
        return Some(datetime.format("%Y-%m-%dT%H:%M:%S").to_string());
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, format) {
        return Some(
            date.and_hms_opt(0, 0, 0)?
                .format("%Y-%m-%dT%H:%M:%S")
                .to_string(),
        );
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{QueryDef, QueryType};
    use chrono::Utc;

    fn compiled(text: &str, query_type: QueryType, multi: bool) -> CompiledQuery {
        CompiledQuery::compile(&QueryDef {
            id: 1,
            website: None,
            name: "q".to_string(),
            text: text.to_string(),
            query_type,
            result_bool: false,
            result_single: true,
            result_multi: multi,
            text_only: true,
        })
        .unwrap()
    }

    fn state() -> ParserState {
        let db = crate::repository::test_db();
        ParserState {
            crawled: "t".to_string(),
            config: ParserConfig::default(),
            engine: UrlListEngine::new(db.clone(), "t", "t"),
            contents: ContentRepository::new(db.clone(), "t", "t"),
            targets: TargetTableRepository::new(db),
            target_table: "t".to_string(),
            id_column: "parsed_id".to_string(),
            datetime_column: "parsed_datetime".to_string(),
            id_queries: Vec::new(),
            datetime_queries: Vec::new(),
            field_queries: Vec::new(),
            id_from_url: None,
        }
    }

    fn url_row(url: &str) -> UrlRow {
        UrlRow {
            id: 1,
            url: url.to_string(),
            manual: false,
        }
    }

    fn content_row(content: &str) -> ContentRow {
        ContentRow {
            id: 1,
            url_id: 1,
            crawltime: Utc::now(),
            archived: false,
            response: 200,
            content_type: "text/html".to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn test_happy_path_id_and_datetime() {
        let mut state = state();
        state.id_queries = vec![(
            compiled("article@id", QueryType::Selector, false),
            QuerySource::Content,
        )];
        state.datetime_queries = vec![DatetimeQuery {
            query: compiled("time", QueryType::Selector, false),
            source: QuerySource::Content,
            format: DEFAULT_DATETIME_FORMAT.to_string(),
            locale: None,
        }];

        let content = content_row(
            r#"<article id="42"><time>2024-01-02 03:04:05</time>text</article>"#,
        );
        let row = state
            .parse_content(&url_row("/a"), &content)
            .unwrap()
            .unwrap();

        assert_eq!(row.parsed_id, "42");
        assert_eq!(row.datetime.as_deref(), Some("2024-01-02T03:04:05"));
    }

    #[test]
    fn test_id_fallback_to_url_regex() {
        let mut state = state();
        state.id_queries = vec![(
            compiled("article@id", QueryType::Selector, false),
            QuerySource::Content,
        )];
        state.id_from_url = Some(Regex::new(r"/article/(\d+)").unwrap());

        let row = state
            .parse_content(&url_row("/article/777"), &content_row("<p>no id</p>"))
            .unwrap()
            .unwrap();
        assert_eq!(row.parsed_id, "777");
    }

    #[test]
    fn test_missing_id_is_a_warning() {
        let state = state();
        let result = state.parse_content(&url_row("/a"), &content_row("<p>x</p>"));
        assert!(result.is_err());
    }

    #[test]
    fn test_ignored_id_skips_row() {
        let mut state = state();
        state.id_queries = vec![(
            compiled("article@id", QueryType::Selector, false),
            QuerySource::Content,
        )];
        state.config.parser.id_ignore = vec!["0".to_string()];

        let result = state
            .parse_content(&url_row("/a"), &content_row(r#"<article id="0">x</article>"#))
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_field_join_and_json() {
        let mut state = state();
        state.id_queries = vec![(
            compiled("article@id", QueryType::Selector, false),
            QuerySource::Content,
        )];
        state.field_queries = vec![
            FieldQuery {
                name: "tags".to_string(),
                query: compiled("li", QueryType::Selector, true),
                source: QuerySource::Content,
                delimiter: ',',
                ignore_empty: true,
                json: false,
                tidy: true,
                warn_empty: false,
            },
            FieldQuery {
                name: "tags_json".to_string(),
                query: compiled("li", QueryType::Selector, true),
                source: QuerySource::Content,
                delimiter: ',',
                ignore_empty: true,
                json: true,
                tidy: true,
                warn_empty: false,
            },
        ];

        let content = content_row(
            r#"<article id="9"><ul><li> a </li><li>b</li><li></li></ul></article>"#,
        );
        let row = state
            .parse_content(&url_row("/a"), &content)
            .unwrap()
            .unwrap();

        assert_eq!(row.fields[0], ("tags".to_string(), Some("a,b".to_string())));
        assert_eq!(
            row.fields[1],
            ("tags_json".to_string(), Some(r#"["a","b"]"#.to_string()))
        );
    }

    #[test]
    fn test_empty_field_yields_null() {
        let mut state = state();
        state.id_queries = vec![(
            compiled("article@id", QueryType::Selector, false),
            QuerySource::Content,
        )];
        state.field_queries = vec![FieldQuery {
            name: "missing".to_string(),
            query: compiled("nav", QueryType::Selector, true),
            source: QuerySource::Content,
            delimiter: ',',
            ignore_empty: true,
            json: false,
            tidy: false,
            warn_empty: false,
        }];

        let row = state
            .parse_content(&url_row("/a"), &content_row(r#"<article id="1">x</article>"#))
            .unwrap()
            .unwrap();
        assert_eq!(row.fields[0], ("missing".to_string(), None));
    }

    #[test]
    fn test_datetime_formats() {
        assert_eq!(
            parse_datetime_value("2024-01-02 03:04:05", DEFAULT_DATETIME_FORMAT).as_deref(),
            Some("2024-01-02T03:04:05")
        );
        assert_eq!(
            parse_datetime_value("02.01.2024", "%d.%m.%Y").as_deref(),
            Some("2024-01-02T00:00:00")
        );
        assert_eq!(parse_datetime_value("garbage", DEFAULT_DATETIME_FORMAT), None);
    }
}

//! Analyzer module running the Markov text generator.
//!
//! The analyzer reads textual rows from configured source tables (usually
//! parser output), compiles them into k-gram statistics, and writes
//! generated sentences to its own target table. The compiled chain is
//! rebuilt on every start; the thread's `last` cursor counts the sentences
//! written so far.

mod config;

pub use config::{AnalyzerConfig, InputSource};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::markov::MarkovGenerator;
use crate::models::ModuleKind;
use crate::repository::{
    crawled_table, lock_named, target_table, TargetColumn, TargetTableRepository,
};
use crate::supervisor::{WorkerEnv, WorkerError, WorkerModule, WorkerResult};

struct AnalyzerState {
    config: AnalyzerConfig,
    targets: TargetTableRepository,
    result_table: String,
    generator: MarkovGenerator,
    compiled: bool,
    rng: StdRng,
}

pub struct AnalyzerModule {
    env: Arc<WorkerEnv>,
    state: Option<AnalyzerState>,
}

impl AnalyzerModule {
    pub fn new(env: Arc<WorkerEnv>) -> Self {
        Self { env, state: None }
    }
}

#[async_trait]
impl WorkerModule for AnalyzerModule {
    async fn on_init(&mut self, resumed: bool) -> WorkerResult<()> {
        let env = &self.env;
        env.set_status("initializing");

        let config = AnalyzerConfig::parse(&env.config_json)
            .map_err(|e| WorkerError::Config(format!("cannot parse configuration: {e}")))?;

        if config.general.result_table.is_empty() {
            return Err(WorkerError::Config("general.result.table is not set".to_string()));
        }
        if config.general.input_tables.len() != config.general.input_fields.len() {
            return Err(WorkerError::Config(
                "input.tables and input.fields differ in length".to_string(),
            ));
        }
        if config.markov.dimension < 2 {
            return Err(WorkerError::Config(
                "markov.dimension must be at least 2".to_string(),
            ));
        }

        let targets = TargetTableRepository::new(env.db.clone());

        let lock_name = format!("targetlock.analyzed.{}.{}", env.website.id, env.list.id);
        let control = env.control.clone();
        let guard = lock_named(&lock_name, move || control.is_running());
        if guard.is_none() {
            return Err(WorkerError::Config("stopped while waiting for table lock".to_string()));
        }
        let (_, result_table) = targets.add_or_get(
            ModuleKind::Analyzer,
            env.website.id,
            env.list.id,
            &env.website.namespace,
            &env.list.namespace,
            &config.general.result_table,
            &[TargetColumn::new(&config.general.result_field, "TEXT")],
            false,
        )?;
        drop(guard);

        let mut generator = MarkovGenerator::new();
        generator.set_min_corpora(config.markov.min_corpora);

        // The emoticon list lives in the website's data directory.
        if let Some(file) = &config.markov.emoticons_file {
            match &env.website.data_dir {
                Some(dir) => match std::fs::read_to_string(dir.join(file)) {
                    Ok(content) => {
                        generator
                            .set_emoticons(content.lines().map(|l| l.trim_end().to_string()));
                    }
                    Err(e) => env.log(&format!("cannot read emoticon list '{file}': {e}")),
                },
                None => env.log("emoticons.file configured but the website has no data directory"),
            }
        }

        if config.markov.spellcheck {
            env.log("spellcheck requested but no spell checker is linked; continuing without");
        }

        // The generator reports through the worker's status row and log.
        {
            let control = env.control.clone();
            generator.set_is_running(Box::new(move || control.is_running()));
        }
        {
            let env_cb = self.env.clone();
            generator.set_status(Box::new(move |message| env_cb.set_status(message)));
        }
        {
            let env_cb = self.env.clone();
            generator.set_progress(Box::new(move |fraction| env_cb.set_progress(fraction)));
        }
        if config.general.logging > 1 {
            let env_cb = self.env.clone();
            generator.set_log(Box::new(move |message| env_cb.log(message)));
        }

        // An emoji sequence list in the data directory feeds the prefix
        // trie used during tokenization.
        if let Some(dir) = &env.website.data_dir {
            if let Ok(content) = std::fs::read_to_string(dir.join("emojis.txt")) {
                generator.set_emojis(content.lines().map(|l| l.trim_end().to_string()));
            }
        }

        if resumed {
            env.log("resuming after interruption");
        }
        env.set_status("ready");

        self.state = Some(AnalyzerState {
            config,
            targets,
            result_table,
            generator,
            compiled: false,
            rng: StdRng::from_os_rng(),
        });
        Ok(())
    }

    async fn on_tick(&mut self) -> WorkerResult<()> {
        let env = self.env.clone();
        let Some(state) = self.state.as_mut() else {
            return Err(WorkerError::Config("analyzer not initialized".to_string()));
        };
        state.tick(&env).await
    }

    async fn on_pause(&mut self) {}

    async fn on_unpause(&mut self) {}

    async fn on_clear(&mut self, _interrupted: bool) {
        self.state = None;
    }
}

impl AnalyzerState {
    async fn tick(&mut self, env: &WorkerEnv) -> WorkerResult<()> {
        if !self.compiled {
            return self.compile(env).await;
        }

        for n in 0..self.config.markov.max.max(1) {
            if !env.is_running() {
                return Ok(());
            }

            let sentence = self
                .generator
                .random_sentence(self.config.markov.length, &mut self.rng);
            let Some(sentence) = sentence else {
                env.set_status("corpus is empty; nothing to generate");
                env.sleep(Duration::from_millis(self.config.general.sleep_idle))
                    .await;
                return Ok(());
            };

            self.targets.insert_row(
                &self.result_table,
                None,
                &[(self.config.general.result_field.clone(), Some(sentence))],
            )?;

            let written = env.last() + 1;
            env.set_last(written)?;
            env.set_status(&format!("generated sentence #{written}"));
            if self.config.general.logging > 2 {
                env.log(&format!("generated sentence #{written} ({}/{})", n + 1, self.config.markov.max));
            }
        }

        env.sleep(Duration::from_millis(self.config.markov.sleep)).await;
        Ok(())
    }

    /// Load the corpora and compile the chain. Every non-null text cell of
    /// the configured input columns becomes one corpus. `input.sources`
    /// selects the table family of each entry, so an analyzer can read
    /// parser, extractor, or other analyzer output, or crawled content.
    async fn compile(&mut self, env: &WorkerEnv) -> WorkerResult<()> {
        env.set_status("loading corpus");

        let mut corpora = 0usize;
        for (index, (table, field)) in self
            .config
            .general
            .input_tables
            .iter()
            .zip(&self.config.general.input_fields)
            .enumerate()
        {
            let source = self
                .config
                .general
                .input_sources
                .get(index)
                .copied()
                .unwrap_or_default();
            let full = input_table_name(
                source,
                &env.website.namespace,
                &env.list.namespace,
                table,
            );
            let texts = self.targets.column_texts(&full, field)?;
            for text in texts {
                if !text.trim().is_empty() {
                    self.generator.add_corpus(text);
                    corpora += 1;
                }
            }
        }

        if corpora == 0 {
            env.set_status("waiting for input data");
            env.sleep(Duration::from_millis(self.config.general.sleep_idle))
                .await;
            return Ok(());
        }

        if self.config.general.logging > 0 {
            env.log(&format!("compiling Markov chain from {corpora} corpora"));
        }
        env.set_status("compiling Markov chain");

        let dimension = self.config.markov.dimension;
        if !self.generator.compile(dimension) {
            // Cancelled through the is-running callback.
            return Ok(());
        }

        self.compiled = true;
        env.set_progress(0.0);
        env.set_status("chain compiled");
        Ok(())
    }
}

/// Full table name for one input entry. The crawled-content table is one
/// per list, so its entry ignores the configured table name.
fn input_table_name(
    source: InputSource,
    website_ns: &str,
    list_ns: &str,
    table: &str,
) -> String {
    match source {
        InputSource::Parsing => target_table(website_ns, list_ns, "parsed", table),
        InputSource::Extracting => target_table(website_ns, list_ns, "extracted", table),
        InputSource::Analyzing => target_table(website_ns, list_ns, "analyzed", table),
        InputSource::Crawling => crawled_table(website_ns, list_ns),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{UrlListProps, WebsiteProps};
    use crate::repository::{
        test_db, UrlListEngine, UrlListRepository, WebsiteRepository,
    };

    #[test]
    fn test_input_table_name_per_source() {
        assert_eq!(
            input_table_name(InputSource::Parsing, "ex", "news", "articles"),
            "webharvest_ex_news_parsed_articles"
        );
        assert_eq!(
            input_table_name(InputSource::Extracting, "ex", "news", "notes"),
            "webharvest_ex_news_extracted_notes"
        );
        assert_eq!(
            input_table_name(InputSource::Analyzing, "ex", "news", "sentences"),
            "webharvest_ex_news_analyzed_sentences"
        );
        assert_eq!(
            input_table_name(InputSource::Crawling, "ex", "news", "ignored"),
            "webharvest_ex_news_crawled"
        );
    }

    #[test]
    fn test_corpus_from_extracted_table() {
        let db = test_db();
        let site = WebsiteRepository::new(db.clone())
            .add(&WebsiteProps {
                domain: Some("example.com".to_string()),
                namespace: "ex".to_string(),
                name: "Example".to_string(),
                data_dir: None,
            })
            .unwrap();
        let list = UrlListRepository::new(db.clone())
            .add(
                site,
                &UrlListProps {
                    namespace: "news".to_string(),
                    name: "News".to_string(),
                },
            )
            .unwrap();
        let url = UrlListEngine::new(db.clone(), "ex", "news")
            .add("/a", false)
            .unwrap();

        // Extractor output feeds the analyzer when input.sources says so.
        let targets = TargetTableRepository::new(db);
        let (_, extracted) = targets
            .add_or_get(
                ModuleKind::Extractor,
                site,
                list,
                "ex",
                "news",
                "notes",
                &[TargetColumn::new("text", "TEXT")],
                false,
            )
            .unwrap();
        targets
            .upsert_row(
                &extracted,
                url,
                &[("text".to_string(), Some("The cat sat. The dog ran.".to_string()))],
            )
            .unwrap();

        let config = AnalyzerConfig::parse(
            r#"{
                "general": {
                    "input.tables": ["notes"],
                    "input.sources": ["extracting"],
                    "input.fields": ["text"]
                }
            }"#,
        )
        .unwrap();

        let mut generator = MarkovGenerator::new();
        for (index, (table, field)) in config
            .general
            .input_tables
            .iter()
            .zip(&config.general.input_fields)
            .enumerate()
        {
            let source = config
                .general
                .input_sources
                .get(index)
                .copied()
                .unwrap_or_default();
            let full = input_table_name(source, "ex", "news", table);
            assert_eq!(full, extracted);
            for text in targets.column_texts(&full, field).unwrap() {
                generator.add_corpus(text);
            }
        }

        assert!(generator.compile(2));
        let mut rng = StdRng::seed_from_u64(21);
        let sentence = generator.random_sentence(40, &mut rng).unwrap();
        assert!(!sentence.is_empty());
    }
}

//! Crawler module.
//!
//! Per URL, one tick runs the pipeline: select, lock, fetch, response and
//! content checks, canonical check, save, link extraction, success mark,
//! and optional archive replay through the Memento protocol. Failures on
//! retriable HTTP statuses keep the lock and retry with a delay; a URL
//! that ultimately fails stays unsuccessful and is re-selected once its
//! lock expires.

mod archive;
mod config;
mod counters;

pub use config::CrawlerConfig;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use url::Url;

use crate::models::{ModuleKind, OversizePolicy, UrlRow};
use crate::queries::{CompiledQuery, HtmlDocument};
use crate::repository::{ContentRepository, UrlListEngine};
use crate::supervisor::{WorkerEnv, WorkerError, WorkerModule, WorkerResult};
use crate::utils::url::{resolve_for_list, to_fetch_url};

use config::{LOGGING_EXTENDED, LOGGING_VERBOSE};

/// Compiled query sets used by the pipeline.
#[derive(Default)]
struct CrawlerQueries {
    blacklist_content: Vec<CompiledQuery>,
    blacklist_types: Vec<CompiledQuery>,
    blacklist_urls: Vec<CompiledQuery>,
    links: Vec<CompiledQuery>,
    whitelist_content: Vec<CompiledQuery>,
    whitelist_types: Vec<CompiledQuery>,
    whitelist_urls: Vec<CompiledQuery>,
    canonical: Option<CompiledQuery>,
}

/// A URL currently being retried.
struct Retry {
    url: UrlRow,
    manual: bool,
    lock: String,
    counter: u64,
    /// Only the archive step remains.
    archive_only: bool,
}

/// One entry of the manual crawl queue (start page, custom URLs, and
/// always-recrawl URLs).
struct ManualEntry {
    url_id: i64,
    is_start: bool,
    /// Crawl regardless of the success flag (`recrawl.always`).
    force: bool,
}

struct CrawlerState {
    config: CrawlerConfig,
    client: reqwest::Client,
    engine: UrlListEngine,
    contents: ContentRepository,
    queries: CrawlerQueries,
    manual_queue: VecDeque<ManualEntry>,
    manual_done: bool,
    always_queued: bool,
    retry: Option<Retry>,
    last_http: Option<Instant>,
}

pub struct CrawlerModule {
    env: Arc<WorkerEnv>,
    state: Option<CrawlerState>,
}

impl CrawlerModule {
    pub fn new(env: Arc<WorkerEnv>) -> Self {
        Self { env, state: None }
    }
}

#[async_trait]
impl WorkerModule for CrawlerModule {
    async fn on_init(&mut self, resumed: bool) -> WorkerResult<()> {
        let env = &self.env;
        env.set_status("initializing");

        let config = CrawlerConfig::parse(&env.config_json)
            .map_err(|e| WorkerError::Config(format!("cannot parse configuration: {e}")))?;

        let counters = counters::validate_counters(&config.custom)?;
        let custom_urls =
            counters::expand_custom_urls(&config.custom.urls, &counters, config.custom.counters_global);

        let client = config.network.build_client()?;

        let engine = UrlListEngine::new(
            env.db.clone(),
            &env.website.namespace,
            &env.list.namespace,
        );
        let contents =
            ContentRepository::new(env.db.clone(), &env.website.namespace, &env.list.namespace);

        let queries = CrawlerQueries {
            blacklist_content: super::load_queries(
                &env.db,
                env.website.id,
                &config.crawler.queries_blacklist_content,
            )?,
            blacklist_types: super::load_queries(
                &env.db,
                env.website.id,
                &config.crawler.queries_blacklist_types,
            )?,
            blacklist_urls: super::load_queries(
                &env.db,
                env.website.id,
                &config.crawler.queries_blacklist_urls,
            )?,
            links: super::load_queries(&env.db, env.website.id, &config.crawler.queries_links)?,
            whitelist_content: super::load_queries(
                &env.db,
                env.website.id,
                &config.crawler.queries_whitelist_content,
            )?,
            whitelist_types: super::load_queries(
                &env.db,
                env.website.id,
                &config.crawler.queries_whitelist_types,
            )?,
            whitelist_urls: super::load_queries(
                &env.db,
                env.website.id,
                &config.crawler.queries_whitelist_urls,
            )?,
            canonical: super::load_query(&env.db, env.website.id, config.crawler.queries_canonical)?,
        };

        // Seed the manual queue: start page first, then the custom URLs.
        let mut manual_queue = VecDeque::new();
        let start = config.crawler.start.clone();
        if !start.is_empty() {
            let url_id = match lookup_or_insert(&engine, &start)? {
                Some(id) => id,
                None => {
                    return Err(WorkerError::Config(format!("invalid start page '{start}'")))
                }
            };
            manual_queue.push_back(ManualEntry {
                url_id,
                is_start: true,
                force: false,
            });
        }
        for custom in &custom_urls {
            match lookup_or_insert(&engine, custom)? {
                Some(url_id) => manual_queue.push_back(ManualEntry {
                    url_id,
                    is_start: false,
                    force: false,
                }),
                None => env.log(&format!("skipping invalid custom URL '{custom}'")),
            }
        }

        if resumed {
            env.log("resuming after interruption");
        }
        env.set_status("ready");

        self.state = Some(CrawlerState {
            config,
            client,
            engine,
            contents,
            queries,
            manual_queue,
            manual_done: false,
            always_queued: false,
            retry: None,
            last_http: None,
        });
        Ok(())
    }

    async fn on_tick(&mut self) -> WorkerResult<()> {
        let env = self.env.clone();
        let Some(state) = self.state.as_mut() else {
            return Err(WorkerError::Config("crawler not initialized".to_string()));
        };
        state.tick(&env).await
    }

    async fn on_pause(&mut self) {}

    async fn on_unpause(&mut self) {}

    async fn on_clear(&mut self, _interrupted: bool) {
        self.state = None;
    }
}

/// Look up a manual URL, inserting it if unknown. Returns `None` for URLs
/// that do not fit the list's form.
fn lookup_or_insert(engine: &UrlListEngine, url: &str) -> WorkerResult<Option<i64>> {
    if url.is_empty() {
        return Ok(None);
    }
    if let Some(id) = engine.id_of(url)? {
        return Ok(Some(id));
    }
    Ok(Some(engine.add(url, true)?))
}

impl CrawlerState {
    async fn tick(&mut self, env: &WorkerEnv) -> WorkerResult<()> {
        if let Some(retry) = self.retry.take() {
            return self.crawl_with_retry(env, retry).await;
        }

        // Manual mode: start page and custom URLs come first.
        while let Some(entry) = self.manual_queue.pop_front() {
            let url = self.engine.get(entry.url_id)?;
            let recrawl = entry.force
                || if entry.is_start {
                    self.config.crawler.recrawl_start
                } else {
                    self.config.custom.recrawl
                };
            if !recrawl && self.engine.is_finished(entry.url_id, ModuleKind::Crawler)? {
                continue;
            }
            return self
                .crawl_with_retry(
                    env,
                    Retry {
                        url,
                        manual: true,
                        lock: String::new(),
                        counter: 0,
                        archive_only: false,
                    },
                )
                .await;
        }
        if !self.manual_done {
            self.manual_done = true;
            self.log(env, LOGGING_EXTENDED, "manual crawling finished");
        }

        // Automatic mode: next lockable URL after the cursor, skipping URLs
        // the operator's URL filters exclude.
        let mut filtered = 0;
        while filtered < 100 {
            let Some(url) = self.engine.next_for(
                ModuleKind::Crawler,
                env.last(),
                self.config.crawler.recrawl,
            )?
            else {
                return self.idle(env).await;
            };

            if !self.url_allowed(&url.url) {
                self.log(
                    env,
                    LOGGING_EXTENDED,
                    &format!("URL excluded by filter: {}", url.url),
                );
                env.set_last(url.id)?;
                filtered += 1;
                continue;
            }

            self.always_queued = false;
            return self
                .crawl_with_retry(
                    env,
                    Retry {
                        url,
                        manual: false,
                        lock: String::new(),
                        counter: 0,
                        archive_only: false,
                    },
                )
                .await;
        }
        Ok(())
    }

    /// No automatic work: queue the always-recrawl URLs once, then sleep.
    async fn idle(&mut self, env: &WorkerEnv) -> WorkerResult<()> {
        if !self.always_queued && !self.config.crawler.recrawl_always.is_empty() {
            self.always_queued = true;
            let always = self.config.crawler.recrawl_always.clone();
            for url in &always {
                if let Some(id) = self.engine.id_of(url)? {
                    self.manual_queue.push_back(ManualEntry {
                        url_id: id,
                        is_start: false,
                        force: true,
                    });
                }
            }
            if !self.manual_queue.is_empty() {
                return Ok(());
            }
        }

        env.set_status("idle");
        env.sleep(Duration::from_millis(self.config.crawler.sleep_idle))
            .await;
        Ok(())
    }

    /// Crawl one URL, rescheduling it on retriable failure.
    async fn crawl_with_retry(&mut self, env: &WorkerEnv, mut retry: Retry) -> WorkerResult<()> {
        // (Re-)acquire the lock.
        let lock = if retry.lock.is_empty() {
            self.engine
                .lock(retry.url.id, ModuleKind::Crawler, self.config.crawler.lock)?
        } else {
            self.engine.try_renew(
                retry.url.id,
                ModuleKind::Crawler,
                &retry.lock,
                self.config.crawler.lock,
            )?
        };
        let Some(lock) = lock else {
            self.log(
                env,
                LOGGING_EXTENDED,
                &format!("URL {} is held by another crawler", retry.url.url),
            );
            return Ok(());
        };
        retry.lock = lock;

        env.set_status(&format!("crawling {}", retry.url.url));
        if let (Ok(position), Ok(total)) = (
            self.engine.position_of(retry.url.id),
            self.engine.count(),
        ) {
            if total > 0 {
                env.set_progress(position as f32 / total as f32);
            }
        }

        match self.crawl_once(env, &retry).await? {
            Outcome::Done => {
                if !self
                    .engine
                    .mark_success(retry.url.id, ModuleKind::Crawler, &retry.lock)?
                {
                    self.log(
                        env,
                        LOGGING_EXTENDED,
                        &format!("lost lock on {} before commit", retry.url.url),
                    );
                    return Ok(());
                }
                if !retry.manual {
                    env.set_last(retry.url.id)?;
                }
                Ok(())
            }
            Outcome::Skip(reason) => {
                self.log(
                    env,
                    LOGGING_EXTENDED,
                    &format!("skipping {}: {reason}", retry.url.url),
                );
                self.engine
                    .unlock_if_held(retry.url.id, ModuleKind::Crawler, &retry.lock)?;
                if !retry.manual {
                    env.set_last(retry.url.id)?;
                }
                Ok(())
            }
            Outcome::RetryLater { archive_only, why } => {
                retry.counter += 1;
                let retries = self.config.crawler.retries;
                if retries >= 0 && retry.counter > retries as u64 {
                    // Give up but keep the lock; the URL is re-selected
                    // after the lock expires.
                    self.log(
                        env,
                        config::LOGGING_DEFAULT,
                        &format!(
                            "giving up on {} after {} attempts ({why})",
                            retry.url.url, retry.counter
                        ),
                    );
                    return Ok(());
                }

                self.log(
                    env,
                    config::LOGGING_DEFAULT,
                    &format!("retrying {} ({why})", retry.url.url),
                );
                retry.archive_only = archive_only;
                env.sleep(Duration::from_millis(self.config.crawler.sleep_error))
                    .await;
                self.retry = Some(retry);
                Ok(())
            }
        }
    }

    /// One pass over the pipeline for a locked URL.
    async fn crawl_once(&mut self, env: &WorkerEnv, retry: &Retry) -> WorkerResult<Outcome> {
        let domain = env.website.domain.clone();
        let Some(fetch_url) = to_fetch_url(&retry.url.url, domain.as_deref()) else {
            return Ok(Outcome::Skip("URL does not form a fetchable address".to_string()));
        };

        if !retry.archive_only {
            let outcome = self.crawl_live(env, retry, &fetch_url, domain.as_deref()).await?;
            if !matches!(outcome, Outcome::Done) {
                return Ok(outcome);
            }
        }

        if self.config.crawler.archives {
            let ok = self
                .archive_replay(env, retry, &fetch_url, domain.as_deref())
                .await?;
            if !ok && self.config.crawler.retry_archive {
                return Ok(Outcome::RetryLater {
                    archive_only: true,
                    why: "archive fetch failed".to_string(),
                });
            }
        }

        Ok(Outcome::Done)
    }

    async fn crawl_live(
        &mut self,
        env: &WorkerEnv,
        retry: &Retry,
        fetch_url: &Url,
        domain: Option<&str>,
    ) -> WorkerResult<Outcome> {
        self.pace_http(env).await;

        let response = match self.client.get(fetch_url.clone()).send().await {
            Ok(response) => response,
            Err(e) => {
                return Ok(Outcome::RetryLater {
                    archive_only: false,
                    why: format!("request failed: {e}"),
                })
            }
        };

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let advertised_length = response.content_length();

        let raw = match response.bytes().await {
            Ok(raw) => raw,
            Err(e) => {
                return Ok(Outcome::RetryLater {
                    archive_only: false,
                    why: format!("body read failed: {e}"),
                })
            }
        };

        // Response check: retriable statuses reschedule, aliases count as
        // success, everything else drops the URL.
        if self.config.crawler.retry_http.contains(&status) {
            return Ok(Outcome::RetryLater {
                archive_only: false,
                why: format!("HTTP {status}"),
            });
        }
        let success = (200..300).contains(&status)
            || self.config.crawler.response_aliases.contains(&status);
        if !success {
            return Ok(Outcome::Skip(format!("HTTP {status}")));
        }

        if !self.type_allowed(&content_type) {
            return Ok(Outcome::Skip(format!("content type '{content_type}' excluded")));
        }

        // Consistency: a short read against the advertised length is
        // treated as a truncated transfer.
        if let Some(advertised) = advertised_length {
            if advertised != raw.len() as u64 {
                return Ok(Outcome::RetryLater {
                    archive_only: false,
                    why: format!("truncated body ({} of {advertised} bytes)", raw.len()),
                });
            }
        }

        let body = String::from_utf8_lossy(&raw).into_owned();

        // Everything that needs the parsed tree happens synchronously in
        // one pass so the document never lives across an await.
        let page = self.evaluate_page(&retry.url.url, &body, fetch_url, domain);

        if let Some(reason) = page.skip {
            return Ok(Outcome::Skip(reason));
        }

        self.contents
            .save(retry.url.id, status, &content_type, &body, OversizePolicy::Trim)?;

        let mut new_urls = 0u64;
        for link in &page.links {
            if self.engine.add_if_new(link, false)?.is_some() {
                new_urls += 1;
            }
        }

        self.log(
            env,
            LOGGING_VERBOSE,
            &format!(
                "crawled {} [HTTP {status}, {} bytes, {new_urls} new URLs]",
                retry.url.url,
                body.len()
            ),
        );

        Ok(Outcome::Done)
    }

    /// Fetch archived copies of the URL from each configured archive.
    async fn archive_replay(
        &mut self,
        env: &WorkerEnv,
        retry: &Retry,
        fetch_url: &Url,
        domain: Option<&str>,
    ) -> WorkerResult<bool> {
        let mut all_ok = true;
        let timemaps = self.config.crawler.archives_urls_timemap.clone();
        let names = self.config.crawler.archives_names.clone();

        for (index, timemap_base) in timemaps.iter().enumerate() {
            if !env.is_running() {
                return Ok(true);
            }
            let archive = names.get(index).map(String::as_str).unwrap_or("archive");
            let timemap_url = format!("{timemap_base}{fetch_url}");

            self.pace_http(env).await;
            let response = match self.client.get(&timemap_url).send().await {
                Ok(response) => response,
                Err(e) => {
                    self.log(
                        env,
                        LOGGING_EXTENDED,
                        &format!("{archive}: timemap request failed: {e}"),
                    );
                    all_ok = false;
                    continue;
                }
            };
            if response.status().as_u16() == 404 {
                continue;
            }
            if !response.status().is_success() {
                all_ok = false;
                continue;
            }
            let timemap = match response.text().await {
                Ok(text) => text,
                Err(_) => {
                    all_ok = false;
                    continue;
                }
            };

            let (mementos, warnings) = archive::parse_mementos(&timemap);
            for warning in warnings {
                self.log(env, LOGGING_VERBOSE, &format!("{archive}: {warning}"));
            }

            for memento in mementos {
                if !env.is_running() {
                    return Ok(true);
                }
                if self.contents.is_archived(retry.url.id, &memento.timestamp)? {
                    continue;
                }

                env.set_status(&format!(
                    "crawling {} [{archive}: {}]",
                    retry.url.url, memento.timestamp
                ));

                self.pace_http(env).await;
                let response = match self.client.get(&memento.url).send().await {
                    Ok(response) => response,
                    Err(_) => {
                        all_ok = false;
                        continue;
                    }
                };
                let status = response.status().as_u16();
                if !response.status().is_success() {
                    all_ok = false;
                    continue;
                }
                let raw = match response.bytes().await {
                    Ok(raw) => raw,
                    Err(_) => {
                        all_ok = false;
                        continue;
                    }
                };
                let body = String::from_utf8_lossy(&raw).into_owned();

                // Archived copies feed the same link filter; their links
                // carry the archive prefix, which is stripped first.
                let links = self.extract_archived_links(&body, fetch_url, domain);

                self.contents.save_archived(
                    retry.url.id,
                    &memento.timestamp,
                    status,
                    "text/html",
                    &body,
                    OversizePolicy::Trim,
                )?;

                for link in &links {
                    self.engine.add_if_new(link, false)?;
                }
            }
        }

        Ok(all_ok)
    }

    /// Delay between HTTP requests when `sleep.http` is configured.
    async fn pace_http(&mut self, env: &WorkerEnv) {
        let pace = Duration::from_millis(self.config.crawler.sleep_http);
        if pace.is_zero() {
            self.last_http = Some(Instant::now());
            return;
        }
        if let Some(last) = self.last_http {
            let elapsed = last.elapsed();
            if elapsed < pace {
                env.sleep(pace - elapsed).await;
            }
        }
        self.last_http = Some(Instant::now());
    }

    fn log(&self, env: &WorkerEnv, level: u8, message: &str) {
        if self.config.crawler.logging >= level {
            env.log(message);
        }
    }

    // -------------------------------------------------------------------------
    // Synchronous pipeline checks
    // -------------------------------------------------------------------------

    fn url_allowed(&self, url: &str) -> bool {
        let doc = HtmlDocument::parse("");
        if self
            .queries
            .blacklist_urls
            .iter()
            .any(|q| q.matches(&doc, url))
        {
            return false;
        }
        if !self.queries.whitelist_urls.is_empty()
            && !self
                .queries
                .whitelist_urls
                .iter()
                .any(|q| q.matches(&doc, url))
        {
            return false;
        }
        true
    }

    fn type_allowed(&self, content_type: &str) -> bool {
        let doc = HtmlDocument::parse("");
        if self
            .queries
            .blacklist_types
            .iter()
            .any(|q| q.matches(&doc, content_type))
        {
            return false;
        }
        if !self.queries.whitelist_types.is_empty()
            && !self
                .queries
                .whitelist_types
                .iter()
                .any(|q| q.matches(&doc, content_type))
        {
            return false;
        }
        true
    }

    /// Parse the body once and run every tree-dependent check: canonical,
    /// content filters, and link extraction.
    fn evaluate_page(
        &self,
        stored_url: &str,
        body: &str,
        base: &Url,
        domain: Option<&str>,
    ) -> PageDecision {
        let doc = HtmlDocument::parse(body);

        if let Some(canonical_query) = &self.queries.canonical {
            if let Some(canonical) = canonical_query.first(&doc, body) {
                if let Some(resolved) = resolve_for_list(base, &canonical, domain) {
                    if resolved.into_string() != stored_url {
                        return PageDecision::skip("canonical URL differs");
                    }
                }
            }
        }

        if self
            .queries
            .blacklist_content
            .iter()
            .any(|q| q.matches(&doc, body))
        {
            return PageDecision::skip("content excluded by blacklist");
        }
        if !self.queries.whitelist_content.is_empty()
            && !self
                .queries
                .whitelist_content
                .iter()
                .any(|q| q.matches(&doc, body))
        {
            return PageDecision::skip("content not covered by whitelist");
        }

        let links = self.collect_links(&doc, body, base, domain);
        PageDecision { skip: None, links }
    }

    /// Candidate links from the configured extraction queries, resolved
    /// against the base URL and filtered.
    fn collect_links(
        &self,
        doc: &HtmlDocument,
        body: &str,
        base: &Url,
        domain: Option<&str>,
    ) -> Vec<String> {
        let mut links = Vec::new();
        for query in &self.queries.links {
            for candidate in query.all(doc, body) {
                let Some(stored) = resolve_for_list(base, &candidate, domain) else {
                    continue;
                };
                let stored = stored.into_string();
                if stored.len() > crate::models::MAX_URL_BYTES {
                    continue;
                }
                if !self.params_allowed(&stored) {
                    continue;
                }
                if !self.url_allowed(&stored) {
                    continue;
                }
                if !links.contains(&stored) {
                    links.push(stored);
                }
            }
        }
        links
    }

    /// Apply `params.blacklist` / `params.whitelist` to the query string
    /// of a stored URL form.
    fn params_allowed(&self, stored: &str) -> bool {
        let blacklist = &self.config.crawler.params_blacklist;
        let whitelist = &self.config.crawler.params_whitelist;
        if blacklist.is_empty() && whitelist.is_empty() {
            return true;
        }

        let Some((_, query)) = stored.split_once('?') else {
            return true;
        };

        for pair in query.split('&') {
            let name = pair.split('=').next().unwrap_or(pair);
            if name.is_empty() {
                continue;
            }
            if blacklist.iter().any(|b| b == name) {
                return false;
            }
            if !whitelist.is_empty() && !whitelist.iter().any(|w| w == name) {
                return false;
            }
        }
        true
    }

    /// Links from an archived copy, with the archive's own URL prefix
    /// stripped before resolution.
    fn extract_archived_links(
        &self,
        body: &str,
        base: &Url,
        domain: Option<&str>,
    ) -> Vec<String> {
        let doc = HtmlDocument::parse(body);
        let mut links = Vec::new();
        for query in &self.queries.links {
            for candidate in query.all(&doc, body) {
                let candidate = strip_archive_prefix(&candidate);
                let Some(stored) = resolve_for_list(base, candidate, domain) else {
                    continue;
                };
                let stored = stored.into_string();
                if stored.len() > crate::models::MAX_URL_BYTES {
                    continue;
                }
                if !self.params_allowed(&stored) || !self.url_allowed(&stored) {
                    continue;
                }
                if !links.contains(&stored) {
                    links.push(stored);
                }
            }
        }
        links
    }
}

enum Outcome {
    /// Pipeline completed; commit the URL.
    Done,
    /// Deliberately not crawled; unlock and move on.
    Skip(String),
    /// Retriable failure.
    RetryLater { archive_only: bool, why: String },
}

impl PageDecision {
    fn skip(reason: &str) -> Self {
        Self {
            skip: Some(reason.to_string()),
            links: Vec::new(),
        }
    }
}

struct PageDecision {
    skip: Option<String>,
    links: Vec<String>,
}

/// Remove a web-archive rewrite prefix
/// (`http://web.archive.org/web/<ts>/http://…`), keeping the original URL.
fn strip_archive_prefix(link: &str) -> &str {
    if link.len() < 2 || !link.is_char_boundary(1) {
        return link;
    }
    for marker in ["http://", "https://"] {
        if let Some(pos) = link[1..].find(marker) {
            return &link[pos + 1..];
        }
    }
    link
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{QueryDef, QueryType};

    fn selector_query(text: &str) -> CompiledQuery {
        CompiledQuery::compile(&QueryDef {
            id: 1,
            website: None,
            name: "q".to_string(),
            text: text.to_string(),
            query_type: QueryType::Selector,
            result_bool: true,
            result_single: true,
            result_multi: true,
            text_only: false,
        })
        .unwrap()
    }

    fn regex_query(text: &str) -> CompiledQuery {
        CompiledQuery::compile(&QueryDef {
            id: 2,
            website: None,
            name: "q".to_string(),
            text: text.to_string(),
            query_type: QueryType::Regex,
            result_bool: true,
            result_single: true,
            result_multi: true,
            text_only: false,
        })
        .unwrap()
    }

    fn state_with_queries(queries: CrawlerQueries, config: CrawlerConfig) -> CrawlerState {
        let db = crate::repository::test_db();
        CrawlerState {
            config,
            client: reqwest::Client::new(),
            engine: UrlListEngine::new(db.clone(), "t", "t"),
            contents: ContentRepository::new(db, "t", "t"),
            queries,
            manual_queue: VecDeque::new(),
            manual_done: false,
            always_queued: false,
            retry: None,
            last_http: None,
        }
    }

    fn base() -> Url {
        Url::parse("https://example.com/a").unwrap()
    }

    #[test]
    fn test_link_extraction_with_domain_filter() {
        let queries = CrawlerQueries {
            links: vec![selector_query("a@href")],
            ..Default::default()
        };
        let state = state_with_queries(queries, CrawlerConfig::default());

        let body = r#"<a href="https://example.com/b">in</a>
                      <a href="https://other.test/c">out</a>
                      <a href="/d">relative</a>"#;
        let page = state.evaluate_page("/a", body, &base(), Some("example.com"));

        assert!(page.skip.is_none());
        assert_eq!(page.links, vec!["/b".to_string(), "/d".to_string()]);
    }

    #[test]
    fn test_canonical_mismatch_skips() {
        let queries = CrawlerQueries {
            canonical: Some(selector_query("link[rel=\"canonical\"]@href")),
            ..Default::default()
        };
        let state = state_with_queries(queries, CrawlerConfig::default());

        let body = r#"<link rel="canonical" href="https://example.com/other">"#;
        let page = state.evaluate_page("/a", body, &base(), Some("example.com"));
        assert!(page.skip.is_some());

        let body = r#"<link rel="canonical" href="https://example.com/a">"#;
        let page = state.evaluate_page("/a", body, &base(), Some("example.com"));
        assert!(page.skip.is_none());
    }

    #[test]
    fn test_content_blacklist_skips() {
        let queries = CrawlerQueries {
            blacklist_content: vec![regex_query("paywall")],
            ..Default::default()
        };
        let state = state_with_queries(queries, CrawlerConfig::default());

        let page = state.evaluate_page(
            "/a",
            "<p>behind a paywall</p>",
            &base(),
            Some("example.com"),
        );
        assert!(page.skip.is_some());

        let page = state.evaluate_page("/a", "<p>free text</p>", &base(), Some("example.com"));
        assert!(page.skip.is_none());
    }

    #[test]
    fn test_params_blacklist() {
        let mut config = CrawlerConfig::default();
        config.crawler.params_blacklist = vec!["session".to_string()];
        let state = state_with_queries(CrawlerQueries::default(), config);

        assert!(state.params_allowed("/a?page=2"));
        assert!(!state.params_allowed("/a?session=xyz"));
        assert!(!state.params_allowed("/a?page=2&session=xyz"));
        assert!(state.params_allowed("/a"));
    }

    #[test]
    fn test_params_whitelist() {
        let mut config = CrawlerConfig::default();
        config.crawler.params_whitelist = vec!["page".to_string()];
        let state = state_with_queries(CrawlerQueries::default(), config);

        assert!(state.params_allowed("/a?page=2"));
        assert!(!state.params_allowed("/a?track=1"));
    }

    #[test]
    fn test_url_filter_queries() {
        let queries = CrawlerQueries {
            blacklist_urls: vec![regex_query(r"/login")],
            ..Default::default()
        };
        let state = state_with_queries(queries, CrawlerConfig::default());

        assert!(state.url_allowed("/article/1"));
        assert!(!state.url_allowed("/login?next=/"));
    }

    #[test]
    fn test_strip_archive_prefix() {
        assert_eq!(
            strip_archive_prefix("http://web.archive.org/web/2015/http://example.com/b"),
            "http://example.com/b"
        );
        assert_eq!(
            strip_archive_prefix("https://example.com/plain"),
            "https://example.com/plain"
        );
        assert_eq!(strip_archive_prefix("/relative"), "/relative");
    }

    #[test]
    fn test_type_filter() {
        let queries = CrawlerQueries {
            whitelist_types: vec![regex_query("text/html")],
            ..Default::default()
        };
        let state = state_with_queries(queries, CrawlerConfig::default());

        assert!(state.type_allowed("text/html; charset=utf-8"));
        assert!(!state.type_allowed("application/pdf"));
    }
}

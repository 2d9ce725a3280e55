//! Repository layer for database persistence.
//!
//! Every repository owns a handle to a [`Db`], which caches one SQLite
//! connection per worker and recycles it after an idle period. All SQL goes
//! through a busy-retry wrapper so that lock contention between workers is
//! absorbed with backoff instead of surfacing as errors.

mod content;
mod log;
mod module_config;
mod query;
mod target;
mod thread;
mod urllist;
mod urls;
mod website;

pub use content::{ContentRepository, DEFAULT_MAX_CONTENT_SIZE};
pub use log::{LogEntry, LogRepository};
pub use module_config::{ConfigEntry, ConfigRepository};
pub use query::QueryRepository;
pub use target::{TargetColumn, TargetTableRepository};
pub use thread::ThreadRepository;
pub use urllist::UrlListRepository;
pub use urls::UrlListEngine;
pub use website::WebsiteRepository;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread as std_thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use thiserror::Error;

/// Recycle a connection that has been idle for this long.
const IDLE_RECONNECT_AFTER: Duration = Duration::from_secs(600);
/// Sleep between attempts when the database reports contention.
const SLEEP_ON_BUSY_MS: u64 = 250;
/// Sleep between attempts to acquire a named advisory lock.
const SLEEP_ON_NAMED_LOCK_MS: u64 = 250;
/// Bounded attempts for busy retries.
const MAX_BUSY_RETRIES: u32 = 5;

/// Table-name prefix shared by every table the server owns.
pub const TABLE_PREFIX: &str = "webharvest";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Storage engine error: {0}")]
    StorageEngine(String),
    #[error("Insufficient privileges: {0}")]
    Privileges(String),
    #[error("Incorrect path: {0}")]
    IncorrectPath(String),
    #[error("Namespace already exists: {0}")]
    NamespaceExists(String),
    #[error("Column type mismatch: {0}")]
    TypeMismatch(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid input: {0}")]
    Invalid(String),
    #[error("Corrupt data: {0}")]
    Corruption(String),
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    /// Whether retrying the operation may succeed without intervention.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Database(e) => is_busy_error(e),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

fn is_busy_error(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
    )
}

/// Parse a datetime string from the database, defaulting to Unix epoch on error.
pub fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// Current time in the canonical timestamp format.
///
/// RFC 3339 in UTC with fixed-width seconds, so that string comparison
/// matches chronological order. Lock expiry and compare-and-set renewal
/// both rely on this.
pub fn now_string() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// A point `seconds` in the future, in the canonical timestamp format.
pub fn in_seconds_string(seconds: u64) -> String {
    (Utc::now() + chrono::Duration::seconds(seconds as i64))
        .to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Cached connection plus the time it was last used.
struct CachedConn {
    conn: Connection,
    last_used: Instant,
}

/// A lazily connected SQLite handle with idle recycling.
///
/// Not shared across workers; every worker owns its own `Db` (and therefore
/// its own connection and prepared-statement cache). The control surface
/// keeps one more for itself.
pub struct Db {
    path: PathBuf,
    state: Mutex<Option<CachedConn>>,
}

impl Db {
    pub fn open(path: &Path) -> Arc<Self> {
        Arc::new(Self {
            path: path.to_path_buf(),
            state: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a fresh worker-owned handle to the same database file.
    pub fn reopen(&self) -> Arc<Self> {
        Db::open(&self.path)
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        // WAL allows multiple readers alongside one writer; the busy timeout
        // absorbs short write contention before our own retry loop kicks in.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 10000;
            PRAGMA cache_size = -64000;
            PRAGMA temp_store = MEMORY;
        "#,
        )
        .map_err(|e| StorageError::Connection(e.to_string()))?;

        Ok(conn)
    }

    /// Run `op` against a live connection, retrying on lock contention.
    ///
    /// The connection is verified before use; one idle longer than the
    /// reconnect threshold is dropped and re-established, which also clears
    /// the prepared-statement cache (statements are re-prepared on demand
    /// through `prepare_cached`).
    pub fn with_conn<T>(&self, mut op: impl FnMut(&Connection) -> Result<T>) -> Result<T> {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let recycle = match guard.as_ref() {
            Some(cached) => {
                cached.last_used.elapsed() > IDLE_RECONNECT_AFTER
                    || cached
                        .conn
                        .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                        .is_err()
            }
            None => true,
        };

        if recycle {
            *guard = Some(CachedConn {
                conn: self.connect()?,
                last_used: Instant::now(),
            });
        }

        let cached = guard.as_mut().expect("connection established above");
        cached.last_used = Instant::now();

        let mut delay_ms = SLEEP_ON_BUSY_MS;
        for attempt in 0..MAX_BUSY_RETRIES {
            match op(&cached.conn) {
                Ok(value) => return Ok(value),
                Err(StorageError::Database(ref e))
                    if is_busy_error(e) && attempt + 1 < MAX_BUSY_RETRIES =>
                {
                    tracing::debug!(
                        "database busy, retrying in {}ms (attempt {}/{})",
                        delay_ms,
                        attempt + 1,
                        MAX_BUSY_RETRIES
                    );
                    std_thread::sleep(Duration::from_millis(delay_ms));
                    delay_ms *= 2;
                }
                Err(e) => return Err(e),
            }
        }

        op(&cached.conn)
    }
}

/// Process-wide advisory locks used to serialize cross-module operations
/// such as target-table provisioning.
fn named_locks() -> &'static Mutex<Vec<String>> {
    static LOCKS: OnceLock<Mutex<Vec<String>>> = OnceLock::new();
    LOCKS.get_or_init(|| Mutex::new(Vec::new()))
}

/// Holds a named advisory lock until dropped.
pub struct NamedLock {
    name: String,
}

impl Drop for NamedLock {
    fn drop(&mut self) {
        let mut locks = named_locks()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.retain(|n| n != &self.name);
    }
}

/// Acquire a process-wide advisory lock, waiting until it is free.
///
/// `is_running` is polled between attempts; returns `None` when the caller
/// has been asked to stop while waiting.
pub fn lock_named(name: &str, is_running: impl Fn() -> bool) -> Option<NamedLock> {
    loop {
        {
            let mut locks = named_locks()
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            if !locks.iter().any(|n| n == name) {
                locks.push(name.to_string());
                return Some(NamedLock {
                    name: name.to_string(),
                });
            }
        }

        if !is_running() {
            return None;
        }

        std_thread::sleep(Duration::from_millis(SLEEP_ON_NAMED_LOCK_MS));
    }
}

// -----------------------------------------------------------------------------
// Table naming
// -----------------------------------------------------------------------------

/// Name of the URL table of a list.
pub fn list_table(website_ns: &str, list_ns: &str) -> String {
    format!("{TABLE_PREFIX}_{website_ns}_{list_ns}")
}

/// Name of the crawled-content table of a list.
pub fn crawled_table(website_ns: &str, list_ns: &str) -> String {
    format!("{TABLE_PREFIX}_{website_ns}_{list_ns}_crawled")
}

/// Name of a per-module lock table of a list.
pub fn lock_table(website_ns: &str, list_ns: &str, lock_suffix: &str) -> String {
    format!("{TABLE_PREFIX}_{website_ns}_{list_ns}_{lock_suffix}")
}

/// Full name of a target table.
pub fn target_table(website_ns: &str, list_ns: &str, infix: &str, name: &str) -> String {
    format!("{TABLE_PREFIX}_{website_ns}_{list_ns}_{infix}_{name}")
}

/// Name of a target-table registry (`parsedtables` etc.).
pub fn target_registry(infix: &str) -> String {
    format!("{TABLE_PREFIX}_{infix}tables")
}

/// Create the global tables. Safe to call repeatedly.
pub fn init_schema(db: &Db) -> Result<()> {
    db.with_conn(|conn| {
        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {p}_websites (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                domain TEXT,
                namespace TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                data_dir TEXT
            );

            CREATE TABLE IF NOT EXISTS {p}_urllists (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                website INTEGER NOT NULL REFERENCES {p}_websites(id),
                namespace TEXT NOT NULL,
                name TEXT NOT NULL,
                UNIQUE(website, namespace)
            );

            CREATE TABLE IF NOT EXISTS {p}_queries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                website INTEGER REFERENCES {p}_websites(id),
                name TEXT NOT NULL,
                text TEXT NOT NULL,
                type TEXT NOT NULL,
                result_bool INTEGER NOT NULL DEFAULT 0,
                result_single INTEGER NOT NULL DEFAULT 0,
                result_multi INTEGER NOT NULL DEFAULT 0,
                text_only INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS {p}_configs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                website INTEGER NOT NULL REFERENCES {p}_websites(id),
                module TEXT NOT NULL,
                name TEXT NOT NULL,
                config TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS {p}_threads (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                module TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT '',
                paused INTEGER NOT NULL DEFAULT 0,
                website INTEGER NOT NULL,
                urllist INTEGER NOT NULL,
                config INTEGER NOT NULL,
                last INTEGER NOT NULL DEFAULT 0,
                progress REAL NOT NULL DEFAULT 0,
                runtime INTEGER NOT NULL DEFAULT 0,
                pausetime INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS {p}_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                module TEXT NOT NULL,
                time TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                entry TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS {p}_parsedtables (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                website INTEGER NOT NULL,
                urllist INTEGER NOT NULL,
                name TEXT NOT NULL,
                compressed INTEGER NOT NULL DEFAULT 0,
                UNIQUE(website, urllist, name)
            );

            CREATE TABLE IF NOT EXISTS {p}_extractedtables (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                website INTEGER NOT NULL,
                urllist INTEGER NOT NULL,
                name TEXT NOT NULL,
                compressed INTEGER NOT NULL DEFAULT 0,
                UNIQUE(website, urllist, name)
            );

            CREATE TABLE IF NOT EXISTS {p}_analyzedtables (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                website INTEGER NOT NULL,
                urllist INTEGER NOT NULL,
                name TEXT NOT NULL,
                compressed INTEGER NOT NULL DEFAULT 0,
                UNIQUE(website, urllist, name)
            );
        "#,
            p = TABLE_PREFIX
        ))?;
        Ok(())
    })
}

#[cfg(test)]
pub(crate) fn test_db() -> Arc<Db> {
    let dir = std::env::temp_dir().join(format!(
        "webharvest-test-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    let db = Db::open(&dir.join("test.db"));
    init_schema(&db).unwrap();
    db
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_ordering_matches_string_ordering() {
        let earlier = now_string();
        let later = in_seconds_string(30);
        assert!(earlier < later);
        assert!(in_seconds_string(0) <= now_string());
    }

    #[test]
    fn test_named_lock_blocks_and_releases() {
        let first = lock_named("unit.lock", || true).unwrap();
        // A second attempt that gives up immediately fails while held.
        assert!(lock_named("unit.lock", || false).is_none());
        drop(first);
        assert!(lock_named("unit.lock", || true).is_some());
    }

    #[test]
    fn test_table_names() {
        assert_eq!(list_table("ex", "news"), "webharvest_ex_news");
        assert_eq!(
            lock_table("ex", "news", "crawling"),
            "webharvest_ex_news_crawling"
        );
        assert_eq!(
            target_table("ex", "news", "parsed", "articles"),
            "webharvest_ex_news_parsed_articles"
        );
        assert_eq!(target_registry("parsed"), "webharvest_parsedtables");
    }

    #[test]
    fn test_init_schema_idempotent() {
        let db = test_db();
        init_schema(&db).unwrap();
        let count: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name LIKE 'webharvest_%'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert!(count >= 9);
    }
}

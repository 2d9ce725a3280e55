//! Per-list URL engine: insertion, deduplication, and the lock lifecycle.
//!
//! All cross-worker serialization goes through the `locktime` column of the
//! per-module lock table. A URL is lockable when its lock row is missing,
//! or its locktime is null or in the past. Conditional operations compare
//! the stored locktime against the string the caller got when locking, so a
//! worker that lost its lock cannot clear or commit someone else's.

use std::sync::Arc;

use rusqlite::{params, OptionalExtension};

use super::{in_seconds_string, list_table, lock_table, now_string, Db, Result, StorageError};
use crate::models::{ModuleKind, UrlRow, MAX_URL_BYTES};

pub struct UrlListEngine {
    db: Arc<Db>,
    urls: String,
    website_ns: String,
    list_ns: String,
}

impl UrlListEngine {
    pub fn new(db: Arc<Db>, website_ns: &str, list_ns: &str) -> Self {
        Self {
            urls: list_table(website_ns, list_ns),
            website_ns: website_ns.to_string(),
            list_ns: list_ns.to_string(),
            db,
        }
    }

    fn locks(&self, module: ModuleKind) -> String {
        lock_table(&self.website_ns, &self.list_ns, module.lock_suffix())
    }

    /// Two-step existence probe: CRC32 hash lookup first, equality check
    /// only on a hash hit. The hash column is indexed but non-unique.
    pub fn exists(&self, url: &str) -> Result<bool> {
        let hash = crc32fast::hash(url.as_bytes()) as i64;
        self.db.with_conn(|conn| {
            let hash_hit: bool = conn.query_row(
                &format!(
                    "SELECT EXISTS (SELECT id FROM `{}` WHERE hash = ?1)",
                    self.urls
                ),
                params![hash],
                |row| row.get(0),
            )?;
            if !hash_hit {
                return Ok(false);
            }
            let exact: bool = conn.query_row(
                &format!(
                    "SELECT EXISTS (SELECT id FROM `{}` WHERE hash = ?1 AND url = ?2)",
                    self.urls
                ),
                params![hash, url],
                |row| row.get(0),
            )?;
            Ok(exact)
        })
    }

    /// Insert a URL and return its id.
    pub fn add(&self, url: &str, manual: bool) -> Result<i64> {
        if url.len() > MAX_URL_BYTES {
            return Err(StorageError::Invalid(format!(
                "URL exceeds {MAX_URL_BYTES} bytes"
            )));
        }
        if url.is_empty() {
            return Err(StorageError::Invalid("empty URL".to_string()));
        }

        let hash = crc32fast::hash(url.as_bytes()) as i64;
        self.db.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO `{}` (url, hash, manual) VALUES (?1, ?2, ?3)",
                    self.urls
                ),
                params![url, hash, manual],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Insert a URL unless it is already present; returns the id of the new
    /// row, or `None` when it existed.
    pub fn add_if_new(&self, url: &str, manual: bool) -> Result<Option<i64>> {
        if self.exists(url)? {
            return Ok(None);
        }
        self.add(url, manual).map(Some)
    }

    pub fn get(&self, id: i64) -> Result<UrlRow> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT id, url, manual FROM `{}` WHERE id = ?1", self.urls),
                params![id],
                row_to_url,
            )
            .optional()?
            .ok_or_else(|| StorageError::NotFound(format!("URL {id}")))
        })
    }

    pub fn id_of(&self, url: &str) -> Result<Option<i64>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT id FROM `{}` WHERE url = ?1 LIMIT 1", self.urls),
                    params![url],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    /// The next URL for `module` after `cursor`: lowest id strictly greater
    /// than the cursor whose lock row is lockable and (unless `recrawl`)
    /// not yet successful. Manual URLs are skipped; they are the operator's
    /// to schedule.
    pub fn next_for(
        &self,
        module: ModuleKind,
        cursor: i64,
        recrawl: bool,
    ) -> Result<Option<UrlRow>> {
        self.select_next(module, cursor, recrawl, false, None)
    }

    /// Like [`next_for`](Self::next_for), but restricted to URLs that have
    /// at least one content row, and optionally including manual URLs.
    /// Used by the parser-family modules.
    pub fn next_for_with_content(
        &self,
        module: ModuleKind,
        cursor: i64,
        recrawl: bool,
        include_manual: bool,
        crawled_table: &str,
    ) -> Result<Option<UrlRow>> {
        self.select_next(module, cursor, recrawl, include_manual, Some(crawled_table))
    }

    fn select_next(
        &self,
        module: ModuleKind,
        cursor: i64,
        recrawl: bool,
        include_manual: bool,
        require_content: Option<&str>,
    ) -> Result<Option<UrlRow>> {
        let locks = self.locks(module);
        let success_clause = if recrawl {
            ""
        } else {
            "AND (l.success IS NULL OR l.success = 0)"
        };
        let manual_clause = if include_manual { "" } else { "AND u.manual = 0" };
        let content_clause = match require_content {
            Some(crawled) => {
                format!("AND EXISTS (SELECT 1 FROM `{crawled}` c WHERE c.url = u.id)")
            }
            None => String::new(),
        };

        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT u.id, u.url, u.manual
                         FROM `{}` u
                         LEFT JOIN `{locks}` l ON l.url = u.id
                         WHERE u.id > ?1
                           {manual_clause}
                           AND (l.locktime IS NULL OR l.locktime < ?2)
                           {success_clause}
                           {content_clause}
                         ORDER BY u.id
                         LIMIT 1",
                        self.urls
                    ),
                    params![cursor, now_string()],
                    row_to_url,
                )
                .optional()?)
        })
    }

    /// Take the lock for `duration` seconds if the URL is lockable.
    /// Returns the stored locktime for later conditional operations, or
    /// `None` when another worker holds the URL.
    pub fn lock(&self, url_id: i64, module: ModuleKind, duration: u64) -> Result<Option<String>> {
        let locks = self.locks(module);
        let locktime = in_seconds_string(duration);

        self.db.with_conn(|conn| {
            let changed = conn.execute(
                &format!(
                    "INSERT INTO `{locks}` (url, locktime, success) VALUES (?1, ?2, 0)
                     ON CONFLICT(url) DO UPDATE SET locktime = excluded.locktime
                     WHERE locktime IS NULL OR locktime < ?3"
                ),
                params![url_id, locktime, now_string()],
            )?;
            Ok((changed > 0).then(|| locktime.clone()))
        })
    }

    /// Renew a lock the caller believes it holds. Succeeds when the stored
    /// locktime still equals `previous`, or the lock has expired or was
    /// cleared; returns the new locktime, or `None` when another worker
    /// holds the URL.
    pub fn try_renew(
        &self,
        url_id: i64,
        module: ModuleKind,
        previous: &str,
        duration: u64,
    ) -> Result<Option<String>> {
        let locks = self.locks(module);
        let locktime = in_seconds_string(duration);

        self.db.with_conn(|conn| {
            let changed = conn.execute(
                &format!(
                    "INSERT INTO `{locks}` (url, locktime, success) VALUES (?1, ?2, 0)
                     ON CONFLICT(url) DO UPDATE SET locktime = excluded.locktime
                     WHERE locktime IS NULL OR locktime = ?3 OR locktime < ?4"
                ),
                params![url_id, locktime, previous, now_string()],
            )?;
            Ok((changed > 0).then(|| locktime.clone()))
        })
    }

    /// Release the lock iff the stored locktime matches `previous`.
    pub fn unlock_if_held(&self, url_id: i64, module: ModuleKind, previous: &str) -> Result<bool> {
        let locks = self.locks(module);
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                &format!("UPDATE `{locks}` SET locktime = NULL WHERE url = ?1 AND locktime = ?2"),
                params![url_id, previous],
            )?;
            Ok(changed > 0)
        })
    }

    /// Commit: set the success bit and clear the lock, iff the stored
    /// locktime matches `previous`.
    pub fn mark_success(&self, url_id: i64, module: ModuleKind, previous: &str) -> Result<bool> {
        let locks = self.locks(module);
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                &format!(
                    "UPDATE `{locks}` SET success = 1, locktime = NULL
                     WHERE url = ?1 AND locktime = ?2"
                ),
                params![url_id, previous],
            )?;
            Ok(changed > 0)
        })
    }

    /// Whether the module has already finished this URL.
    pub fn is_finished(&self, url_id: i64, module: ModuleKind) -> Result<bool> {
        let locks = self.locks(module);
        self.db.with_conn(|conn| {
            let finished: bool = conn.query_row(
                &format!(
                    "SELECT EXISTS (SELECT 1 FROM `{locks}` WHERE url = ?1 AND success = 1)"
                ),
                params![url_id],
                |row| row.get(0),
            )?;
            Ok(finished)
        })
    }

    pub fn count(&self) -> Result<u64> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                &format!("SELECT COUNT(id) FROM `{}`", self.urls),
                [],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    /// Number of URL ids below `url_id`, for progress display.
    pub fn position_of(&self, url_id: i64) -> Result<u64> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                &format!("SELECT COUNT(id) FROM `{}` WHERE id < ?1", self.urls),
                params![url_id],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }
}

fn row_to_url(row: &rusqlite::Row) -> rusqlite::Result<UrlRow> {
    Ok(UrlRow {
        id: row.get(0)?,
        url: row.get(1)?,
        manual: row.get::<_, i64>(2)? != 0,
    })
}

//! Crawled-content repository.
//!
//! Content rows are append-only; setting the crawl lock's success bit is
//! the commit point for a crawl, so a crash between insert and commit
//! yields at most a duplicate row, never a lost success.

use std::sync::Arc;

use rusqlite::{params, OptionalExtension};

use super::{crawled_table, parse_datetime, Db, Result, StorageError};
use crate::models::{ContentRow, OversizePolicy};

pub struct ContentRepository {
    db: Arc<Db>,
    crawled: String,
    /// Maximum accepted content size in bytes.
    max_content_size: usize,
}

/// Default cap on stored content bodies (64 MiB).
pub const DEFAULT_MAX_CONTENT_SIZE: usize = 64 * 1024 * 1024;

impl ContentRepository {
    pub fn new(db: Arc<Db>, website_ns: &str, list_ns: &str) -> Self {
        Self {
            crawled: crawled_table(website_ns, list_ns),
            max_content_size: DEFAULT_MAX_CONTENT_SIZE,
            db,
        }
    }

    pub fn with_max_content_size(mut self, max: usize) -> Self {
        self.max_content_size = max;
        self
    }

    /// Apply the oversize policy to a body.
    fn admit<'a>(
        &self,
        content: &'a str,
        policy: OversizePolicy,
    ) -> Result<Option<&'a str>> {
        if content.len() <= self.max_content_size {
            return Ok(Some(content));
        }
        match policy {
            OversizePolicy::Trim => {
                let mut end = self.max_content_size;
                while end > 0 && !content.is_char_boundary(end) {
                    end -= 1;
                }
                Ok(Some(&content[..end]))
            }
            OversizePolicy::Empty => Ok(Some("")),
            OversizePolicy::Null => Ok(None),
            OversizePolicy::Error => Err(StorageError::Invalid(format!(
                "content of {} bytes exceeds the maximum of {}",
                content.len(),
                self.max_content_size
            ))),
        }
    }

    /// Append a freshly crawled content row.
    pub fn save(
        &self,
        url_id: i64,
        response: u16,
        content_type: &str,
        content: &str,
        policy: OversizePolicy,
    ) -> Result<i64> {
        let body = self.admit(content, policy)?;
        self.db.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO `{}` (url, archived, response, type, content)
                     VALUES (?1, 0, ?2, ?3, ?4)",
                    self.crawled
                ),
                params![url_id, response, content_type, body],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Append an archived copy, carrying the archive timestamp.
    pub fn save_archived(
        &self,
        url_id: i64,
        crawltime: &str,
        response: u16,
        content_type: &str,
        content: &str,
        policy: OversizePolicy,
    ) -> Result<i64> {
        let body = self.admit(content, policy)?;
        self.db.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO `{}` (url, crawltime, archived, response, type, content)
                     VALUES (?1, ?2, 1, ?3, ?4, ?5)",
                    self.crawled
                ),
                params![url_id, crawltime, response, content_type, body],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Whether an archived copy with this timestamp already exists.
    pub fn is_archived(&self, url_id: i64, crawltime: &str) -> Result<bool> {
        self.db.with_conn(|conn| {
            let found: bool = conn.query_row(
                &format!(
                    "SELECT EXISTS (SELECT 1 FROM `{}`
                     WHERE url = ?1 AND crawltime = ?2 AND archived = 1)",
                    self.crawled
                ),
                params![url_id, crawltime],
                |row| row.get(0),
            )?;
            Ok(found)
        })
    }

    /// The latest non-archived content row for a URL.
    pub fn latest(&self, url_id: i64) -> Result<Option<ContentRow>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT id, url, crawltime, archived, response, type, content
                         FROM `{}`
                         WHERE url = ?1 AND archived = 0
                         ORDER BY id DESC LIMIT 1",
                        self.crawled
                    ),
                    params![url_id],
                    row_to_content,
                )
                .optional()?)
        })
    }

    /// All content rows for a URL, oldest first.
    pub fn all(&self, url_id: i64) -> Result<Vec<ContentRow>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT id, url, crawltime, archived, response, type, content
                 FROM `{}` WHERE url = ?1 ORDER BY id",
                self.crawled
            ))?;
            let rows = stmt
                .query_map(params![url_id], row_to_content)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn count(&self, url_id: i64) -> Result<u64> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                &format!("SELECT COUNT(id) FROM `{}` WHERE url = ?1", self.crawled),
                params![url_id],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }
}

fn row_to_content(row: &rusqlite::Row) -> rusqlite::Result<ContentRow> {
    Ok(ContentRow {
        id: row.get(0)?,
        url_id: row.get(1)?,
        crawltime: parse_datetime(&row.get::<_, String>(2)?),
        archived: row.get::<_, i64>(3)? != 0,
        response: row.get::<_, u16>(4)?,
        content_type: row.get(5)?,
        content: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::super::{test_db, UrlListEngine, UrlListRepository, WebsiteRepository};
    use super::*;
    use crate::models::{UrlListProps, WebsiteProps};

    fn setup() -> (ContentRepository, i64) {
        let db = test_db();
        let site = WebsiteRepository::new(db.clone())
            .add(&WebsiteProps {
                domain: Some("example.com".to_string()),
                namespace: "ex".to_string(),
                name: "Example".to_string(),
                data_dir: None,
            })
            .unwrap();
        UrlListRepository::new(db.clone())
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
        (ContentRepository::new(db, "ex", "news"), url)
    }

    #[test]
    fn test_save_and_latest() {
        let (repo, url) = setup();
        repo.save(url, 200, "text/html", "<p>first</p>", OversizePolicy::Error)
            .unwrap();
        repo.save(url, 200, "text/html", "<p>second</p>", OversizePolicy::Error)
            .unwrap();

        let latest = repo.latest(url).unwrap().unwrap();
        assert_eq!(latest.content, "<p>second</p>");
        assert_eq!(latest.response, 200);
        assert_eq!(repo.count(url).unwrap(), 2);
    }

    #[test]
    fn test_archived_rows_skipped_by_latest() {
        let (repo, url) = setup();
        repo.save(url, 200, "text/html", "live", OversizePolicy::Error)
            .unwrap();
        repo.save_archived(
            url,
            "2015-06-01T12:00:00.000000Z",
            200,
            "text/html",
            "memento",
            OversizePolicy::Error,
        )
        .unwrap();

        assert_eq!(repo.latest(url).unwrap().unwrap().content, "live");
        assert!(repo
            .is_archived(url, "2015-06-01T12:00:00.000000Z")
            .unwrap());
        assert!(!repo
            .is_archived(url, "2016-01-01T00:00:00.000000Z")
            .unwrap());
        assert_eq!(repo.all(url).unwrap().len(), 2);
    }

    #[test]
    fn test_oversize_policies() {
        let (repo, url) = setup();
        let repo = repo.with_max_content_size(8);

        assert!(matches!(
            repo.save(url, 200, "text/html", "123456789", OversizePolicy::Error)
                .unwrap_err(),
            StorageError::Invalid(_)
        ));

        repo.save(url, 200, "text/html", "123456789", OversizePolicy::Trim)
            .unwrap();
        assert_eq!(repo.latest(url).unwrap().unwrap().content, "12345678");

        repo.save(url, 200, "text/html", "123456789", OversizePolicy::Empty)
            .unwrap();
        assert_eq!(repo.latest(url).unwrap().unwrap().content, "");

        repo.save(url, 200, "text/html", "123456789", OversizePolicy::Null)
            .unwrap();
        assert_eq!(repo.latest(url).unwrap().unwrap().content, "");
        assert!(repo
            .save(url, 200, "text/html", "short", OversizePolicy::Error)
            .is_ok());
    }
}

//! Operator-visible log persistence.
//!
//! Entries arriving as raw bytes are repaired before storage; a marker is
//! appended when invalid UTF-8 had to be removed.

use std::sync::Arc;

use rusqlite::params;

use super::{Db, Result, TABLE_PREFIX};
use crate::utils::text::{repair_utf8, UTF8_REPAIR_MARKER};

pub struct LogRepository {
    db: Arc<Db>,
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub id: i64,
    pub module: String,
    pub time: String,
    pub entry: String,
}

impl LogRepository {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    pub fn insert(&self, module: &str, entry: &str) -> Result<()> {
        let module = if module.is_empty() { "[unknown]" } else { module };
        let entry = if entry.is_empty() { "[empty]" } else { entry };

        self.db.with_conn(|conn| {
            conn.execute(
                &format!("INSERT INTO {TABLE_PREFIX}_log (module, entry) VALUES (?1, ?2)"),
                params![module, entry],
            )?;
            Ok(())
        })
    }

    /// Insert an entry from raw bytes, scrubbing invalid UTF-8.
    pub fn insert_raw(&self, module: &str, entry: &[u8]) -> Result<()> {
        let (mut repaired, was_repaired) = repair_utf8(entry);
        if was_repaired {
            repaired.push(' ');
            repaired.push_str(UTF8_REPAIR_MARKER);
        }
        self.insert(module, &repaired)
    }

    pub fn count(&self, module: Option<&str>) -> Result<u64> {
        self.db.with_conn(|conn| {
            let count: i64 = match module {
                Some(module) => conn.query_row(
                    &format!("SELECT COUNT(*) FROM {TABLE_PREFIX}_log WHERE module = ?1"),
                    params![module],
                    |row| row.get(0),
                )?,
                None => conn.query_row(
                    &format!("SELECT COUNT(*) FROM {TABLE_PREFIX}_log"),
                    [],
                    |row| row.get(0),
                )?,
            };
            Ok(count as u64)
        })
    }

    pub fn clear(&self, module: Option<&str>) -> Result<()> {
        self.db.with_conn(|conn| {
            match module {
                Some(module) => conn.execute(
                    &format!("DELETE FROM {TABLE_PREFIX}_log WHERE module = ?1"),
                    params![module],
                )?,
                None => conn.execute(&format!("DELETE FROM {TABLE_PREFIX}_log"), [])?,
            };
            Ok(())
        })
    }

    /// Most recent entries, newest first.
    pub fn tail(&self, module: Option<&str>, limit: u32) -> Result<Vec<LogEntry>> {
        self.db.with_conn(|conn| {
            let rows = match module {
                Some(module) => {
                    let mut stmt = conn.prepare_cached(&format!(
                        "SELECT id, module, time, entry FROM {TABLE_PREFIX}_log
                         WHERE module = ?1 ORDER BY id DESC LIMIT ?2"
                    ))?;
                    let entries = stmt
                        .query_map(params![module, limit], row_to_entry)?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    entries
                }
                None => {
                    let mut stmt = conn.prepare_cached(&format!(
                        "SELECT id, module, time, entry FROM {TABLE_PREFIX}_log
                         ORDER BY id DESC LIMIT ?1"
                    ))?;
                    let entries = stmt
                        .query_map(params![limit], row_to_entry)?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    entries
                }
            };
            Ok(rows)
        })
    }
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<LogEntry> {
    Ok(LogEntry {
        id: row.get(0)?,
        module: row.get(1)?,
        time: row.get(2)?,
        entry: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::super::test_db;
    use super::*;

    #[test]
    fn test_insert_and_tail() {
        let db = test_db();
        let repo = LogRepository::new(db);

        repo.insert("crawler", "started").unwrap();
        repo.insert("crawler", "finished").unwrap();
        repo.insert("parser", "idle").unwrap();

        assert_eq!(repo.count(Some("crawler")).unwrap(), 2);
        assert_eq!(repo.count(None).unwrap(), 3);

        let tail = repo.tail(Some("crawler"), 10).unwrap();
        assert_eq!(tail[0].entry, "finished");
        assert_eq!(tail[1].entry, "started");

        repo.clear(Some("crawler")).unwrap();
        assert_eq!(repo.count(Some("crawler")).unwrap(), 0);
        assert_eq!(repo.count(Some("parser")).unwrap(), 1);
    }

    #[test]
    fn test_placeholders_for_empty_fields() {
        let db = test_db();
        let repo = LogRepository::new(db);

        repo.insert("", "").unwrap();
        let tail = repo.tail(None, 1).unwrap();
        assert_eq!(tail[0].module, "[unknown]");
        assert_eq!(tail[0].entry, "[empty]");
    }

    #[test]
    fn test_raw_entry_scrubbed_with_marker() {
        let db = test_db();
        let repo = LogRepository::new(db);

        repo.insert_raw("crawler", b"bad \xFF byte").unwrap();
        let tail = repo.tail(Some("crawler"), 1).unwrap();
        assert!(tail[0].entry.starts_with("bad  byte"));
        assert!(tail[0].entry.ends_with(UTF8_REPAIR_MARKER));
    }
}

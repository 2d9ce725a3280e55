//! Worker-thread row persistence.

use std::sync::Arc;

use rusqlite::{params, OptionalExtension};

use super::{Db, Result, StorageError, TABLE_PREFIX};
use crate::models::{ModuleKind, ThreadEntry, ThreadProps};

pub struct ThreadRepository {
    db: Arc<Db>,
}

impl ThreadRepository {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Register a worker and return its persistent id.
    pub fn add(&self, props: &ThreadProps) -> Result<i64> {
        self.db.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {TABLE_PREFIX}_threads (module, website, urllist, config)
                     VALUES (?1, ?2, ?3, ?4)"
                ),
                params![
                    props.module.as_str(),
                    props.website,
                    props.urllist,
                    props.config
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get(&self, id: i64) -> Result<ThreadEntry> {
        self.db.with_conn(|conn| {
            match conn
                .query_row(
                    &format!(
                        "SELECT id, module, status, paused, website, urllist, config,
                                last, progress, runtime, pausetime
                         FROM {TABLE_PREFIX}_threads WHERE id = ?1"
                    ),
                    params![id],
                    row_to_thread,
                )
                .optional()?
            {
                Some(entry) => entry,
                None => Err(StorageError::NotFound(format!("thread {id}"))),
            }
        })
    }

    /// All registered workers, for restart recovery and status display.
    pub fn list(&self) -> Result<Vec<ThreadEntry>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT id, module, status, paused, website, urllist, config,
                        last, progress, runtime, pausetime
                 FROM {TABLE_PREFIX}_threads ORDER BY id"
            ))?;
            let entries = stmt
                .query_map([], row_to_thread)?
                .collect::<std::result::Result<Vec<_>, _>>()?
                .into_iter()
                .collect::<Result<Vec<_>>>()?;
            Ok(entries)
        })
    }

    pub fn set_status(&self, id: i64, paused: bool, status: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                &format!(
                    "UPDATE {TABLE_PREFIX}_threads SET paused = ?1, status = ?2 WHERE id = ?3"
                ),
                params![paused, status, id],
            )?;
            Ok(())
        })
    }

    pub fn set_last(&self, id: i64, last: i64) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                &format!("UPDATE {TABLE_PREFIX}_threads SET last = ?1 WHERE id = ?2"),
                params![last, id],
            )?;
            Ok(())
        })
    }

    pub fn set_progress(&self, id: i64, progress: f64) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                &format!("UPDATE {TABLE_PREFIX}_threads SET progress = ?1 WHERE id = ?2"),
                params![progress, id],
            )?;
            Ok(())
        })
    }

    pub fn set_runtime(&self, id: i64, runtime: u64) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                &format!("UPDATE {TABLE_PREFIX}_threads SET runtime = ?1 WHERE id = ?2"),
                params![runtime as i64, id],
            )?;
            Ok(())
        })
    }

    pub fn set_pausetime(&self, id: i64, pausetime: u64) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                &format!("UPDATE {TABLE_PREFIX}_threads SET pausetime = ?1 WHERE id = ?2"),
                params![pausetime as i64, id],
            )?;
            Ok(())
        })
    }

    /// Zero the progress cursor (operator-triggered reset).
    pub fn reset_last(&self, id: i64) -> Result<()> {
        self.set_last(id, 0)
    }

    pub fn delete(&self, id: i64) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                &format!("DELETE FROM {TABLE_PREFIX}_threads WHERE id = ?1"),
                params![id],
            )?;
            Ok(())
        })
    }
}

fn row_to_thread(row: &rusqlite::Row) -> rusqlite::Result<Result<ThreadEntry>> {
    let module_str: String = row.get(1)?;
    let Some(module) = ModuleKind::from_str(&module_str) else {
        return Ok(Err(StorageError::Corruption(format!(
            "unknown module '{module_str}' in thread row"
        ))));
    };

    Ok(Ok(ThreadEntry {
        id: row.get(0)?,
        module,
        status: row.get(2)?,
        paused: row.get::<_, i64>(3)? != 0,
        website: row.get(4)?,
        urllist: row.get(5)?,
        config: row.get(6)?,
        last: row.get(7)?,
        progress: row.get(8)?,
        runtime: row.get::<_, i64>(9)? as u64,
        pausetime: row.get::<_, i64>(10)? as u64,
    }))
}

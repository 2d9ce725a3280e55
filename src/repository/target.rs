//! Dynamic target tables owned by parser, extractor, and analyzer workers.
//!
//! Target tables are provisioned on demand with operator-declared columns.
//! Provisioning is idempotent: re-declaring an existing table adds missing
//! columns, reuses compatible ones, and rejects incompatible types. A named
//! advisory lock per (type, website, list) serializes concurrent
//! provisioning by workers on the same list.

use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};

use super::{target_registry, target_table, Db, Result, StorageError};
use crate::models::{is_valid_namespace, ModuleKind};

/// An operator-declared target column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetColumn {
    pub name: String,
    /// SQL type, e.g. `TEXT` or `INTEGER`. Only the first word is
    /// significant for compatibility checks.
    pub sql_type: String,
}

impl TargetColumn {
    pub fn new(name: &str, sql_type: &str) -> Self {
        Self {
            name: name.to_string(),
            sql_type: sql_type.to_string(),
        }
    }

    fn base_type(&self) -> String {
        self.sql_type
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_ascii_lowercase()
    }
}

pub struct TargetTableRepository {
    db: Arc<Db>,
}

impl TargetTableRepository {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Provision a target table, or reconcile an existing one.
    ///
    /// Returns the registry id and the full table name. Parser and
    /// extractor tables key their rows by URL (one row per processed URL);
    /// analyzer tables are append-only.
    #[allow(clippy::too_many_arguments)]
    pub fn add_or_get(
        &self,
        module: ModuleKind,
        website_id: i64,
        list_id: i64,
        website_ns: &str,
        list_ns: &str,
        name: &str,
        columns: &[TargetColumn],
        compressed: bool,
    ) -> Result<(i64, String)> {
        let infix = module.target_infix().ok_or_else(|| {
            StorageError::Invalid(format!("{} has no target tables", module.as_str()))
        })?;

        if !is_valid_namespace(name) {
            return Err(StorageError::Invalid(format!(
                "invalid target table name '{name}'"
            )));
        }
        for column in columns {
            if !is_valid_namespace(&column.name) {
                return Err(StorageError::Invalid(format!(
                    "invalid target column name '{}'",
                    column.name
                )));
            }
        }

        let full = target_table(website_ns, list_ns, infix, name);
        let registry = target_registry(infix);
        let unique_url = matches!(module, ModuleKind::Parser | ModuleKind::Extractor);

        self.db.with_conn(|conn| {
            if table_exists(conn, &full)? {
                reconcile_columns(conn, &full, columns)?;
            } else {
                let urls = super::list_table(website_ns, list_ns);
                // Parser and extractor rows are keyed by URL; analyzer rows
                // need no URL at all (generated data).
                let url_column = if unique_url {
                    "url INTEGER NOT NULL UNIQUE"
                } else {
                    "url INTEGER"
                };
                let mut ddl = format!(
                    "CREATE TABLE `{full}` (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        {url_column} REFERENCES `{urls}`(id)"
                );
                for column in columns {
                    ddl.push_str(&format!(", `{}` {}", column.name, column.sql_type));
                }
                ddl.push(')');
                conn.execute(&ddl, [])?;
            }

            let existing: Option<i64> = conn
                .query_row(
                    &format!(
                        "SELECT id FROM {registry}
                         WHERE website = ?1 AND urllist = ?2 AND name = ?3"
                    ),
                    params![website_id, list_id, name],
                    |row| row.get(0),
                )
                .optional()?;

            let id = match existing {
                Some(id) => id,
                None => {
                    conn.execute(
                        &format!(
                            "INSERT INTO {registry} (website, urllist, name, compressed)
                             VALUES (?1, ?2, ?3, ?4)"
                        ),
                        params![website_id, list_id, name, compressed],
                    )?;
                    conn.last_insert_rowid()
                }
            };

            Ok((id, full.clone()))
        })
    }

    /// Registered target tables of a module for a list.
    pub fn list(&self, module: ModuleKind, list_id: i64) -> Result<Vec<(i64, String)>> {
        let infix = module.target_infix().ok_or_else(|| {
            StorageError::Invalid(format!("{} has no target tables", module.as_str()))
        })?;
        let registry = target_registry(infix);

        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT id, name FROM {registry} WHERE urllist = ?1 ORDER BY id"
            ))?;
            let tables = stmt
                .query_map(params![list_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(tables)
        })
    }

    /// Drop a registered target table.
    pub fn delete(&self, module: ModuleKind, table_id: i64) -> Result<()> {
        let infix = module.target_infix().ok_or_else(|| {
            StorageError::Invalid(format!("{} has no target tables", module.as_str()))
        })?;
        let registry = target_registry(infix);
        let prefix = super::TABLE_PREFIX;

        self.db.with_conn(|conn| {
            let (name, website_ns, list_ns): (String, String, String) = conn
                .query_row(
                    &format!(
                        "SELECT t.name, w.namespace, l.namespace
                         FROM {registry} t
                         JOIN {prefix}_websites w ON w.id = t.website
                         JOIN {prefix}_urllists l ON l.id = t.urllist
                         WHERE t.id = ?1"
                    ),
                    params![table_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?
                .ok_or_else(|| StorageError::NotFound(format!("target table {table_id}")))?;

            conn.execute(
                &format!(
                    "DROP TABLE IF EXISTS `{}`",
                    target_table(&website_ns, &list_ns, infix, &name)
                ),
                [],
            )?;
            conn.execute(
                &format!("DELETE FROM {registry} WHERE id = ?1"),
                params![table_id],
            )?;
            Ok(())
        })
    }

    /// Insert or replace the row for a URL (parser and extractor output).
    pub fn upsert_row(
        &self,
        full_table: &str,
        url_id: i64,
        values: &[(String, Option<String>)],
    ) -> Result<()> {
        let mut columns = String::from("url");
        let mut placeholders = String::from("?1");
        let mut updates = String::new();
        for (i, (name, _)) in values.iter().enumerate() {
            columns.push_str(&format!(", `{name}`"));
            placeholders.push_str(&format!(", ?{}", i + 2));
            if i > 0 {
                updates.push_str(", ");
            }
            updates.push_str(&format!("`{name}` = excluded.`{name}`"));
        }

        let sql = if values.is_empty() {
            format!("INSERT INTO `{full_table}` (url) VALUES (?1) ON CONFLICT(url) DO NOTHING")
        } else {
            format!(
                "INSERT INTO `{full_table}` ({columns}) VALUES ({placeholders})
                 ON CONFLICT(url) DO UPDATE SET {updates}"
            )
        };

        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let mut bound = vec![rusqlite::types::Value::from(url_id)];
            bound.extend(values.iter().map(|(_, v)| match v {
                Some(s) => rusqlite::types::Value::from(s.clone()),
                None => rusqlite::types::Value::Null,
            }));
            stmt.execute(rusqlite::params_from_iter(bound))?;
            Ok(())
        })
    }

    /// Append a row without conflict handling (analyzer output; `url` is
    /// optional there).
    pub fn insert_row(
        &self,
        full_table: &str,
        url_id: Option<i64>,
        values: &[(String, Option<String>)],
    ) -> Result<()> {
        let mut columns = String::from("url");
        let mut placeholders = String::from("?1");
        for (i, (name, _)) in values.iter().enumerate() {
            columns.push_str(&format!(", `{name}`"));
            placeholders.push_str(&format!(", ?{}", i + 2));
        }

        let sql = format!("INSERT INTO `{full_table}` ({columns}) VALUES ({placeholders})");

        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let mut bound = vec![match url_id {
                Some(id) => rusqlite::types::Value::from(id),
                None => rusqlite::types::Value::Null,
            }];
            bound.extend(values.iter().map(|(_, v)| match v {
                Some(s) => rusqlite::types::Value::from(s.clone()),
                None => rusqlite::types::Value::Null,
            }));
            stmt.execute(rusqlite::params_from_iter(bound))?;
            Ok(())
        })
    }

    /// All non-null texts of one column, for analyzer input.
    pub fn column_texts(&self, full_table: &str, column: &str) -> Result<Vec<String>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT `{column}` FROM `{full_table}`
                 WHERE `{column}` IS NOT NULL ORDER BY id"
            ))?;
            let texts = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(texts)
        })
    }

    /// A single stored value for a URL, for re-parse id lookups.
    pub fn value_for_url(
        &self,
        full_table: &str,
        column: &str,
        url_id: i64,
    ) -> Result<Option<String>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT `{column}` FROM `{full_table}` WHERE url = ?1"),
                    params![url_id],
                    |row| row.get(0),
                )
                .optional()?
                .flatten())
        })
    }
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let found: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        params![name],
        |row| row.get(0),
    )?;
    Ok(found)
}

/// Add missing columns; verify types of existing ones.
fn reconcile_columns(conn: &Connection, table: &str, columns: &[TargetColumn]) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(`{table}`)"))?;
    let existing: Vec<(String, String)> = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?.to_ascii_lowercase(),
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    drop(stmt);

    for column in columns {
        match existing.iter().find(|(name, _)| name == &column.name) {
            Some((_, existing_type)) => {
                let declared = column.base_type();
                let found = existing_type
                    .split_whitespace()
                    .next()
                    .unwrap_or("")
                    .to_string();
                if declared != found {
                    return Err(StorageError::TypeMismatch(format!(
                        "column '{}' is {found}, declared as {declared}",
                        column.name
                    )));
                }
            }
            None => {
                conn.execute(
                    &format!(
                        "ALTER TABLE `{table}` ADD COLUMN `{}` {}",
                        column.name, column.sql_type
                    ),
                    [],
                )?;
            }
        }
    }
    Ok(())
}

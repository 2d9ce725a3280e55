//! Per-module configuration repository. Configurations are opaque JSON
//! blobs interpreted by the module they belong to.

use std::sync::Arc;

use rusqlite::{params, OptionalExtension};

use super::{Db, Result, StorageError, TABLE_PREFIX};
use crate::models::ModuleKind;

pub struct ConfigRepository {
    db: Arc<Db>,
}

#[derive(Debug, Clone)]
pub struct ConfigEntry {
    pub id: i64,
    pub website: i64,
    pub module: ModuleKind,
    pub name: String,
    pub config: String,
}

impl ConfigRepository {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    pub fn add(
        &self,
        website: i64,
        module: ModuleKind,
        name: &str,
        config: &serde_json::Value,
    ) -> Result<i64> {
        if name.is_empty() {
            return Err(StorageError::Invalid(
                "configuration name is empty".to_string(),
            ));
        }

        self.db.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {TABLE_PREFIX}_configs (website, module, name, config)
                     VALUES (?1, ?2, ?3, ?4)"
                ),
                params![website, module.as_str(), name, config.to_string()],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// The raw JSON blob of a configuration.
    pub fn get_json(&self, id: i64) -> Result<String> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT config FROM {TABLE_PREFIX}_configs WHERE id = ?1"),
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StorageError::NotFound(format!("configuration {id}")))
        })
    }

    pub fn list(&self, website: i64) -> Result<Vec<ConfigEntry>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT id, website, module, name, config
                 FROM {TABLE_PREFIX}_configs WHERE website = ?1 ORDER BY id"
            ))?;
            let entries = stmt
                .query_map(params![website], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            entries
                .into_iter()
                .map(|(id, website, module, name, config)| {
                    let module = ModuleKind::from_str(&module).ok_or_else(|| {
                        StorageError::Corruption(format!("unknown module '{module}'"))
                    })?;
                    Ok(ConfigEntry {
                        id,
                        website,
                        module,
                        name,
                        config,
                    })
                })
                .collect()
        })
    }

    pub fn update(&self, id: i64, name: &str, config: &serde_json::Value) -> Result<()> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                &format!(
                    "UPDATE {TABLE_PREFIX}_configs SET name = ?1, config = ?2 WHERE id = ?3"
                ),
                params![name, config.to_string(), id],
            )?;
            if changed == 0 {
                return Err(StorageError::NotFound(format!("configuration {id}")));
            }
            Ok(())
        })
    }

    pub fn delete(&self, id: i64) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                &format!("DELETE FROM {TABLE_PREFIX}_configs WHERE id = ?1"),
                params![id],
            )?;
            Ok(())
        })
    }

    pub fn duplicate(&self, id: i64) -> Result<i64> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                &format!(
                    "INSERT INTO {TABLE_PREFIX}_configs (website, module, name, config)
                     SELECT website, module, name || ' (copy)', config
                     FROM {TABLE_PREFIX}_configs WHERE id = ?1"
                ),
                params![id],
            )?;
            if changed == 0 {
                return Err(StorageError::NotFound(format!("configuration {id}")));
            }
            Ok(conn.last_insert_rowid())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_db;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_round_trip() {
        let db = test_db();
        let repo = ConfigRepository::new(db);

        let id = repo
            .add(
                1,
                ModuleKind::Crawler,
                "default",
                &json!({"crawler": {"retries": 3}}),
            )
            .unwrap();

        let raw = repo.get_json(id).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["crawler"]["retries"], 3);

        repo.update(id, "default", &json!({"crawler": {"retries": 5}}))
            .unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&repo.get_json(id).unwrap()).unwrap();
        assert_eq!(value["crawler"]["retries"], 5);

        let copy = repo.duplicate(id).unwrap();
        let entries = repo.list(1).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().any(|e| e.id == copy && e.name == "default (copy)"));
    }
}

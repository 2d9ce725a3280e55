//! Stored-query repository.

use std::sync::Arc;

use rusqlite::{params, OptionalExtension};

use super::{Db, Result, StorageError, TABLE_PREFIX};
use crate::models::{QueryDef, QueryProps, QueryType};

pub struct QueryRepository {
    db: Arc<Db>,
}

impl QueryRepository {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Store a query; `website` of `None` makes it global.
    pub fn add(&self, website: Option<i64>, props: &QueryProps) -> Result<i64> {
        if props.name.is_empty() || props.text.is_empty() {
            return Err(StorageError::Invalid(
                "query name and text must not be empty".to_string(),
            ));
        }

        self.db.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {TABLE_PREFIX}_queries
                         (website, name, text, type, result_bool, result_single,
                          result_multi, text_only)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    website,
                    props.name,
                    props.text,
                    props.query_type.as_str(),
                    props.result_bool,
                    props.result_single,
                    props.result_multi,
                    props.text_only,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get(&self, id: i64) -> Result<QueryDef> {
        self.db.with_conn(|conn| {
            match conn
                .query_row(
                    &format!(
                        "SELECT id, website, name, text, type, result_bool,
                                result_single, result_multi, text_only
                         FROM {TABLE_PREFIX}_queries WHERE id = ?1"
                    ),
                    params![id],
                    row_to_query,
                )
                .optional()?
            {
                Some(query) => query,
                None => Err(StorageError::NotFound(format!("query {id}"))),
            }
        })
    }

    /// Queries of a website plus the global ones.
    pub fn list(&self, website: Option<i64>) -> Result<Vec<QueryDef>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT id, website, name, text, type, result_bool,
                        result_single, result_multi, text_only
                 FROM {TABLE_PREFIX}_queries
                 WHERE website IS NULL OR website = ?1
                 ORDER BY id"
            ))?;
            let queries = stmt
                .query_map(params![website], row_to_query)?
                .collect::<std::result::Result<Vec<_>, _>>()?
                .into_iter()
                .collect::<Result<Vec<_>>>()?;
            Ok(queries)
        })
    }

    pub fn update(&self, id: i64, props: &QueryProps) -> Result<()> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                &format!(
                    "UPDATE {TABLE_PREFIX}_queries
                     SET name = ?1, text = ?2, type = ?3, result_bool = ?4,
                         result_single = ?5, result_multi = ?6, text_only = ?7
                     WHERE id = ?8"
                ),
                params![
                    props.name,
                    props.text,
                    props.query_type.as_str(),
                    props.result_bool,
                    props.result_single,
                    props.result_multi,
                    props.text_only,
                    id,
                ],
            )?;
            if changed == 0 {
                return Err(StorageError::NotFound(format!("query {id}")));
            }
            Ok(())
        })
    }

    pub fn delete(&self, id: i64) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                &format!("DELETE FROM {TABLE_PREFIX}_queries WHERE id = ?1"),
                params![id],
            )?;
            Ok(())
        })
    }

    pub fn duplicate(&self, id: i64) -> Result<i64> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                &format!(
                    "INSERT INTO {TABLE_PREFIX}_queries
                         (website, name, text, type, result_bool, result_single,
                          result_multi, text_only)
                     SELECT website, name || ' (copy)', text, type, result_bool,
                            result_single, result_multi, text_only
                     FROM {TABLE_PREFIX}_queries WHERE id = ?1"
                ),
                params![id],
            )?;
            if changed == 0 {
                return Err(StorageError::NotFound(format!("query {id}")));
            }
            Ok(conn.last_insert_rowid())
        })
    }
}

fn row_to_query(row: &rusqlite::Row) -> rusqlite::Result<Result<QueryDef>> {
    let type_str: String = row.get(4)?;
    let Some(query_type) = QueryType::from_str(&type_str) else {
        return Ok(Err(StorageError::Corruption(format!(
            "unknown query type '{type_str}'"
        ))));
    };

    Ok(Ok(QueryDef {
        id: row.get(0)?,
        website: row.get(1)?,
        name: row.get(2)?,
        text: row.get(3)?,
        query_type,
        result_bool: row.get::<_, i64>(5)? != 0,
        result_single: row.get::<_, i64>(6)? != 0,
        result_multi: row.get::<_, i64>(7)? != 0,
        text_only: row.get::<_, i64>(8)? != 0,
    }))
}

#[cfg(test)]
mod tests {
    use super::super::test_db;
    use super::*;

    fn props(name: &str) -> QueryProps {
        QueryProps {
            name: name.to_string(),
            text: "article".to_string(),
            query_type: QueryType::Selector,
            result_bool: false,
            result_single: true,
            result_multi: false,
            text_only: true,
        }
    }

    #[test]
    fn test_add_get_update_duplicate() {
        let db = test_db();
        let repo = QueryRepository::new(db);

        let id = repo.add(None, &props("ids")).unwrap();
        let query = repo.get(id).unwrap();
        assert_eq!(query.name, "ids");
        assert_eq!(query.query_type, QueryType::Selector);
        assert!(query.result_single);

        let mut updated = props("ids2");
        updated.query_type = QueryType::Regex;
        repo.update(id, &updated).unwrap();
        assert_eq!(repo.get(id).unwrap().query_type, QueryType::Regex);

        let copy = repo.duplicate(id).unwrap();
        assert_ne!(copy, id);
        assert_eq!(repo.get(copy).unwrap().name, "ids2 (copy)");
    }

    #[test]
    fn test_list_includes_global_queries() {
        let db = test_db();
        let repo = QueryRepository::new(db);

        repo.add(None, &props("global")).unwrap();
        repo.add(Some(1), &props("site1")).unwrap();
        repo.add(Some(2), &props("site2")).unwrap();

        let listed = repo.list(Some(1)).unwrap();
        let names: Vec<_> = listed.iter().map(|q| q.name.as_str()).collect();
        assert!(names.contains(&"global"));
        assert!(names.contains(&"site1"));
        assert!(!names.contains(&"site2"));
    }
}

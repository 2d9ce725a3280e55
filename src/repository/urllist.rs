//! URL-list repository.
//!
//! Creating a list provisions its six dependent tables: the URL table, the
//! crawled-content table, and one lock table per module. Lock tables carry
//! one row per URL with `locktime` (null or a timestamp) and a `success`
//! bit that doubles as the module's progress marker.

use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};

use super::website::drop_list_tables;
use super::{
    crawled_table, list_table, lock_table, Db, Result, StorageError, TABLE_PREFIX,
};
use crate::models::{is_valid_namespace, ModuleKind, UrlList, UrlListProps};

pub struct UrlListRepository {
    db: Arc<Db>,
}

impl UrlListRepository {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Create a URL list and provision its dependent tables.
    pub fn add(&self, website_id: i64, props: &UrlListProps) -> Result<i64> {
        if !is_valid_namespace(&props.namespace) {
            return Err(StorageError::Invalid(format!(
                "invalid namespace '{}'",
                props.namespace
            )));
        }
        if props.name.is_empty() {
            return Err(StorageError::Invalid("URL list name is empty".to_string()));
        }

        self.db.with_conn(|conn| {
            let website_ns = website_namespace(conn, website_id)?;

            let taken: i64 = conn.query_row(
                &format!(
                    "SELECT COUNT(*) FROM {TABLE_PREFIX}_urllists
                     WHERE website = ?1 AND namespace = ?2"
                ),
                params![website_id, props.namespace],
                |row| row.get(0),
            )?;
            if taken > 0 {
                return Err(StorageError::NamespaceExists(props.namespace.clone()));
            }

            conn.execute("BEGIN IMMEDIATE", [])?;

            let result: Result<i64> = (|| {
                conn.execute(
                    &format!(
                        "INSERT INTO {TABLE_PREFIX}_urllists (website, namespace, name)
                         VALUES (?1, ?2, ?3)"
                    ),
                    params![website_id, props.namespace, props.name],
                )?;
                let id = conn.last_insert_rowid();

                provision_tables(conn, &website_ns, &props.namespace)?;

                Ok(id)
            })();

            if result.is_ok() {
                conn.execute("COMMIT", [])?;
            } else {
                let _ = conn.execute("ROLLBACK", []);
            }

            result
        })
    }

    pub fn get(&self, id: i64) -> Result<UrlList> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT id, website, namespace, name
                     FROM {TABLE_PREFIX}_urllists WHERE id = ?1"
                ),
                params![id],
                row_to_list,
            )
            .optional()?
            .ok_or_else(|| StorageError::NotFound(format!("URL list {id}")))
        })
    }

    pub fn list(&self, website_id: i64) -> Result<Vec<UrlList>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT id, website, namespace, name
                 FROM {TABLE_PREFIX}_urllists WHERE website = ?1 ORDER BY id"
            ))?;
            let lists = stmt
                .query_map(params![website_id], row_to_list)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(lists)
        })
    }

    /// Namespaces of the owning website and the list itself.
    pub fn namespaces(&self, list_id: i64) -> Result<(String, String)> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT w.namespace, l.namespace
                     FROM {TABLE_PREFIX}_urllists l
                     JOIN {TABLE_PREFIX}_websites w ON w.id = l.website
                     WHERE l.id = ?1"
                ),
                params![list_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| StorageError::NotFound(format!("URL list {list_id}")))
        })
    }

    /// Rename a list; every dependent table is renamed in one transaction.
    pub fn update(&self, id: i64, props: &UrlListProps) -> Result<()> {
        if !is_valid_namespace(&props.namespace) {
            return Err(StorageError::Invalid(format!(
                "invalid namespace '{}'",
                props.namespace
            )));
        }

        let old = self.get(id)?;
        let (website_ns, _) = self.namespaces(id)?;

        self.db.with_conn(|conn| {
            if props.namespace != old.namespace {
                let taken: i64 = conn.query_row(
                    &format!(
                        "SELECT COUNT(*) FROM {TABLE_PREFIX}_urllists
                         WHERE website = ?1 AND namespace = ?2"
                    ),
                    params![old.website, props.namespace],
                    |row| row.get(0),
                )?;
                if taken > 0 {
                    return Err(StorageError::NamespaceExists(props.namespace.clone()));
                }
            }

            conn.execute("BEGIN IMMEDIATE", [])?;

            let result: Result<()> = (|| {
                if props.namespace != old.namespace {
                    rename_list_tables(conn, id, &website_ns, &old.namespace, &props.namespace)?;
                }

                conn.execute(
                    &format!(
                        "UPDATE {TABLE_PREFIX}_urllists SET namespace = ?1, name = ?2
                         WHERE id = ?3"
                    ),
                    params![props.namespace, props.name, id],
                )?;

                Ok(())
            })();

            if result.is_ok() {
                conn.execute("COMMIT", [])?;
            } else {
                let _ = conn.execute("ROLLBACK", []);
            }

            result
        })
    }

    /// Delete a list with all six dependent tables and its target tables.
    pub fn delete(&self, id: i64) -> Result<()> {
        let (website_ns, list_ns) = self.namespaces(id)?;

        self.db.with_conn(|conn| {
            conn.execute("BEGIN IMMEDIATE", [])?;

            let result: Result<()> = (|| {
                drop_list_tables(conn, &website_ns, &list_ns, id)?;
                conn.execute(
                    &format!("DELETE FROM {TABLE_PREFIX}_urllists WHERE id = ?1"),
                    params![id],
                )?;
                Ok(())
            })();

            if result.is_ok() {
                conn.execute("COMMIT", [])?;
            } else {
                let _ = conn.execute("ROLLBACK", []);
            }

            result
        })
    }

    /// Operator-triggered reset: clear success and locktime for a module so
    /// its URLs become eligible again.
    pub fn reset_status(&self, list_id: i64, module: ModuleKind) -> Result<()> {
        let (website_ns, list_ns) = self.namespaces(list_id)?;
        let table = lock_table(&website_ns, &list_ns, module.lock_suffix());

        self.db.with_conn(|conn| {
            conn.execute(
                &format!("UPDATE `{table}` SET success = 0, locktime = NULL"),
                [],
            )?;
            Ok(())
        })
    }
}

fn website_namespace(conn: &Connection, website_id: i64) -> Result<String> {
    conn.query_row(
        &format!("SELECT namespace FROM {TABLE_PREFIX}_websites WHERE id = ?1"),
        params![website_id],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| StorageError::NotFound(format!("website {website_id}")))
}

fn row_to_list(row: &rusqlite::Row) -> rusqlite::Result<UrlList> {
    Ok(UrlList {
        id: row.get(0)?,
        website: row.get(1)?,
        namespace: row.get(2)?,
        name: row.get(3)?,
    })
}

fn provision_tables(conn: &Connection, website_ns: &str, list_ns: &str) -> Result<()> {
    let urls = list_table(website_ns, list_ns);
    let crawled = crawled_table(website_ns, list_ns);

    conn.execute_batch(&format!(
        r#"
        CREATE TABLE `{urls}` (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            url TEXT NOT NULL,
            hash INTEGER NOT NULL DEFAULT 0,
            manual INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX `{urls}_hash` ON `{urls}`(hash);

        CREATE TABLE `{crawled}` (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            url INTEGER NOT NULL REFERENCES `{urls}`(id),
            crawltime TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now')),
            archived INTEGER NOT NULL DEFAULT 0,
            response INTEGER NOT NULL DEFAULT 0,
            type TEXT NOT NULL DEFAULT '',
            content TEXT
        );
        CREATE INDEX `{crawled}_url` ON `{crawled}`(url);
    "#
    ))?;

    for module in [
        ModuleKind::Crawler,
        ModuleKind::Parser,
        ModuleKind::Extractor,
        ModuleKind::Analyzer,
    ] {
        let locks = lock_table(website_ns, list_ns, module.lock_suffix());
        conn.execute_batch(&format!(
            r#"
            CREATE TABLE `{locks}` (
                url INTEGER NOT NULL UNIQUE REFERENCES `{urls}`(id),
                locktime TEXT DEFAULT NULL,
                success INTEGER NOT NULL DEFAULT 0
            );
        "#
        ))?;
    }

    Ok(())
}

fn rename_list_tables(
    conn: &Connection,
    list_id: i64,
    website_ns: &str,
    old_ns: &str,
    new_ns: &str,
) -> Result<()> {
    let mut renames = vec![
        (
            list_table(website_ns, old_ns),
            list_table(website_ns, new_ns),
        ),
        (
            crawled_table(website_ns, old_ns),
            crawled_table(website_ns, new_ns),
        ),
    ];
    for module in [
        ModuleKind::Crawler,
        ModuleKind::Parser,
        ModuleKind::Extractor,
        ModuleKind::Analyzer,
    ] {
        renames.push((
            lock_table(website_ns, old_ns, module.lock_suffix()),
            lock_table(website_ns, new_ns, module.lock_suffix()),
        ));
    }

    for infix in ["parsed", "extracted", "analyzed"] {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT name FROM {} WHERE urllist = ?1",
            super::target_registry(infix)
        ))?;
        let names = stmt
            .query_map(params![list_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for name in names {
            renames.push((
                super::target_table(website_ns, old_ns, infix, &name),
                super::target_table(website_ns, new_ns, infix, &name),
            ));
        }
    }

    for (from, to) in renames {
        conn.execute(&format!("ALTER TABLE `{from}` RENAME TO `{to}`"), [])?;
    }

    rebuild_list_indexes(
        conn,
        &list_table(website_ns, old_ns),
        &crawled_table(website_ns, old_ns),
        &list_table(website_ns, new_ns),
        &crawled_table(website_ns, new_ns),
    )?;
    Ok(())
}

/// Indexes keep their names across `ALTER TABLE … RENAME`; rebuild them so
/// the old names are free for a future list of the same name.
pub(super) fn rebuild_list_indexes(
    conn: &Connection,
    old_urls: &str,
    old_crawled: &str,
    new_urls: &str,
    new_crawled: &str,
) -> Result<()> {
    conn.execute_batch(&format!(
        r#"
        DROP INDEX IF EXISTS `{old_urls}_hash`;
        DROP INDEX IF EXISTS `{old_crawled}_url`;
        CREATE INDEX IF NOT EXISTS `{new_urls}_hash` ON `{new_urls}`(hash);
        CREATE INDEX IF NOT EXISTS `{new_crawled}_url` ON `{new_crawled}`(url);
    "#
    ))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::{test_db, WebsiteRepository};
    use super::*;
    use crate::models::WebsiteProps;

    fn site(db: &Arc<Db>) -> i64 {
        WebsiteRepository::new(db.clone())
            .add(&WebsiteProps {
                domain: Some("example.com".to_string()),
                namespace: "ex".to_string(),
                name: "Example".to_string(),
                data_dir: None,
            })
            .unwrap()
    }

    #[test]
    fn test_add_provisions_six_tables() {
        let db = test_db();
        let site = site(&db);
        let repo = UrlListRepository::new(db.clone());

        repo.add(
            site,
            &UrlListProps {
                namespace: "news".to_string(),
                name: "News".to_string(),
            },
        )
        .unwrap();

        db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master
                 WHERE type='table' AND name LIKE 'webharvest_ex_news%'",
                [],
                |r| r.get(0),
            )?;
            assert_eq!(count, 6);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_duplicate_namespace_rejected_per_website() {
        let db = test_db();
        let site = site(&db);
        let repo = UrlListRepository::new(db);

        let props = UrlListProps {
            namespace: "news".to_string(),
            name: "News".to_string(),
        };
        repo.add(site, &props).unwrap();
        assert!(matches!(
            repo.add(site, &props).unwrap_err(),
            StorageError::NamespaceExists(_)
        ));
    }

    #[test]
    fn test_rename_list_moves_tables() {
        let db = test_db();
        let site = site(&db);
        let repo = UrlListRepository::new(db.clone());

        let id = repo
            .add(
                site,
                &UrlListProps {
                    namespace: "news".to_string(),
                    name: "News".to_string(),
                },
            )
            .unwrap();

        repo.update(
            id,
            &UrlListProps {
                namespace: "press".to_string(),
                name: "Press".to_string(),
            },
        )
        .unwrap();

        db.with_conn(|conn| {
            let old: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name LIKE 'webharvest_ex_news%'",
                [],
                |r| r.get(0),
            )?;
            let new: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master
                 WHERE type='table' AND name LIKE 'webharvest_ex_press%'",
                [],
                |r| r.get(0),
            )?;
            assert_eq!(old, 0);
            assert_eq!(new, 6);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_delete_list() {
        let db = test_db();
        let site = site(&db);
        let repo = UrlListRepository::new(db.clone());

        let id = repo
            .add(
                site,
                &UrlListProps {
                    namespace: "tmp".to_string(),
                    name: "Tmp".to_string(),
                },
            )
            .unwrap();
        repo.delete(id).unwrap();

        assert!(matches!(
            repo.get(id).unwrap_err(),
            StorageError::NotFound(_)
        ));
    }
}

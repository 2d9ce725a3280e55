//! Website repository.
//!
//! Renaming a website rewrites the name of every dependent table; changing
//! its domain type rewrites every URL in every list. Both run inside a
//! single transaction so a failure reverts the parts already done.

use std::path::Path;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};

use super::{
    crawled_table, list_table, lock_table, target_registry, target_table, Db, Result,
    StorageError, TABLE_PREFIX,
};
use crate::models::{is_valid_namespace, Website, WebsiteProps};

pub struct WebsiteRepository {
    db: Arc<Db>,
}

const LOCK_SUFFIXES: [&str; 4] = ["crawling", "parsing", "extracting", "analyzing"];
const TARGET_INFIXES: [&str; 3] = ["parsed", "extracted", "analyzed"];

impl WebsiteRepository {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Register a website. Fails when the namespace is taken or the data
    /// directory does not exist.
    pub fn add(&self, props: &WebsiteProps) -> Result<i64> {
        validate_props(props)?;

        if let Some(dir) = &props.data_dir {
            check_directory(dir)?;
        }

        self.db.with_conn(|conn| {
            if is_namespace_taken(conn, &props.namespace)? {
                return Err(StorageError::NamespaceExists(props.namespace.clone()));
            }

            conn.execute(
                &format!(
                    "INSERT INTO {TABLE_PREFIX}_websites (domain, namespace, name, data_dir)
                     VALUES (?1, ?2, ?3, ?4)"
                ),
                params![
                    normalized_domain(props),
                    props.namespace,
                    props.name,
                    props.data_dir.as_ref().map(|p| p.display().to_string()),
                ],
            )?;

            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get(&self, id: i64) -> Result<Website> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT id, domain, namespace, name, data_dir
                     FROM {TABLE_PREFIX}_websites WHERE id = ?1"
                ),
                params![id],
                row_to_website,
            )
            .optional()?
            .ok_or_else(|| StorageError::NotFound(format!("website {id}")))
        })
    }

    pub fn list(&self) -> Result<Vec<Website>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT id, domain, namespace, name, data_dir
                 FROM {TABLE_PREFIX}_websites ORDER BY id"
            ))?;
            let sites = stmt
                .query_map([], row_to_website)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(sites)
        })
    }

    pub fn is_namespace(&self, namespace: &str) -> Result<bool> {
        self.db
            .with_conn(|conn| is_namespace_taken(conn, namespace))
    }

    /// Update name, namespace, and domain. A namespace change renames every
    /// dependent table; a domain-type change rewrites stored URLs.
    pub fn update(&self, id: i64, props: &WebsiteProps) -> Result<()> {
        validate_props(props)?;

        if let Some(dir) = &props.data_dir {
            check_directory(dir)?;
        }

        let old = self.get(id)?;

        self.db.with_conn(|conn| {
            if props.namespace != old.namespace && is_namespace_taken(conn, &props.namespace)? {
                return Err(StorageError::NamespaceExists(props.namespace.clone()));
            }

            conn.execute("BEGIN IMMEDIATE", [])?;

            let result: Result<()> = (|| {
                let new_domain = normalized_domain(props);

                if old.domain.is_some() != new_domain.is_some() {
                    rewrite_url_forms(conn, id, &old, new_domain.as_deref())?;
                }

                if props.namespace != old.namespace {
                    rename_dependent_tables(conn, id, &old.namespace, &props.namespace)?;
                }

                conn.execute(
                    &format!(
                        "UPDATE {TABLE_PREFIX}_websites
                         SET domain = ?1, namespace = ?2, name = ?3, data_dir = ?4
                         WHERE id = ?5"
                    ),
                    params![
                        new_domain,
                        props.namespace,
                        props.name,
                        props.data_dir.as_ref().map(|p| p.display().to_string()),
                        id,
                    ],
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

    /// Change only the domain, keeping namespace and name.
    pub fn change_domain(&self, id: i64, new_domain: Option<&str>) -> Result<()> {
        let old = self.get(id)?;
        self.update(
            id,
            &WebsiteProps {
                domain: new_domain.map(str::to_string),
                namespace: old.namespace,
                name: old.name,
                data_dir: old.data_dir,
            },
        )
    }

    /// Delete a website and every dependent table and row.
    pub fn delete(&self, id: i64) -> Result<()> {
        let site = self.get(id)?;

        self.db.with_conn(|conn| {
            conn.execute("BEGIN IMMEDIATE", [])?;

            let result: Result<()> = (|| {
                for (list_id, list_ns) in list_namespaces(conn, id)? {
                    drop_list_tables(conn, &site.namespace, &list_ns, list_id)?;
                    conn.execute(
                        &format!("DELETE FROM {TABLE_PREFIX}_urllists WHERE id = ?1"),
                        params![list_id],
                    )?;
                }

                conn.execute(
                    &format!("DELETE FROM {TABLE_PREFIX}_configs WHERE website = ?1"),
                    params![id],
                )?;
                conn.execute(
                    &format!("DELETE FROM {TABLE_PREFIX}_queries WHERE website = ?1"),
                    params![id],
                )?;
                conn.execute(
                    &format!("DELETE FROM {TABLE_PREFIX}_websites WHERE id = ?1"),
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

    /// Duplicate a website: fresh namespace, copied queries and configs,
    /// freshly provisioned (empty) URL lists.
    pub fn duplicate(&self, id: i64) -> Result<i64> {
        let site = self.get(id)?;

        let new_namespace = self.db.with_conn(|conn| {
            let mut counter = 2u32;
            loop {
                let candidate = format!("{}{}", site.namespace, counter);
                if !is_namespace_taken(conn, &candidate)? {
                    return Ok(candidate);
                }
                counter += 1;
            }
        })?;

        let new_id = self.add(&WebsiteProps {
            domain: site.domain.clone(),
            namespace: new_namespace,
            name: format!("{} (copy)", site.name),
            data_dir: site.data_dir.clone(),
        })?;

        self.db.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {TABLE_PREFIX}_queries
                         (website, name, text, type, result_bool, result_single, result_multi, text_only)
                     SELECT ?1, name, text, type, result_bool, result_single, result_multi, text_only
                     FROM {TABLE_PREFIX}_queries WHERE website = ?2"
                ),
                params![new_id, id],
            )?;
            conn.execute(
                &format!(
                    "INSERT INTO {TABLE_PREFIX}_configs (website, module, name, config)
                     SELECT ?1, module, name, config
                     FROM {TABLE_PREFIX}_configs WHERE website = ?2"
                ),
                params![new_id, id],
            )?;
            Ok(())
        })?;

        let lists = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT namespace, name FROM {TABLE_PREFIX}_urllists WHERE website = ?1"
            ))?;
            let lists = stmt
                .query_map(params![id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(lists)
        })?;

        let list_repo = super::UrlListRepository::new(self.db.clone());
        for (namespace, name) in lists {
            list_repo.add(
                new_id,
                &crate::models::UrlListProps { namespace, name },
            )?;
        }

        Ok(new_id)
    }
}

fn validate_props(props: &WebsiteProps) -> Result<()> {
    if !is_valid_namespace(&props.namespace) {
        return Err(StorageError::Invalid(format!(
            "invalid namespace '{}'",
            props.namespace
        )));
    }
    if props.name.is_empty() {
        return Err(StorageError::Invalid("website name is empty".to_string()));
    }
    Ok(())
}

fn normalized_domain(props: &WebsiteProps) -> Option<String> {
    props
        .domain
        .as_deref()
        .filter(|d| !d.is_empty())
        .map(str::to_string)
}

fn check_directory(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        return Err(StorageError::IncorrectPath(dir.display().to_string()));
    }
    Ok(())
}

fn is_namespace_taken(conn: &Connection, namespace: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {TABLE_PREFIX}_websites WHERE namespace = ?1"),
        params![namespace],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn row_to_website(row: &rusqlite::Row) -> rusqlite::Result<Website> {
    Ok(Website {
        id: row.get(0)?,
        domain: row.get(1)?,
        namespace: row.get(2)?,
        name: row.get(3)?,
        data_dir: row.get::<_, Option<String>>(4)?.map(Into::into),
    })
}

fn list_namespaces(conn: &Connection, website_id: i64) -> Result<Vec<(i64, String)>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT id, namespace FROM {TABLE_PREFIX}_urllists WHERE website = ?1"
    ))?;
    let lists = stmt
        .query_map(params![website_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(lists)
}

/// Names of every target table registered for a list, with its infix.
fn registered_target_tables(
    conn: &Connection,
    list_id: i64,
) -> Result<Vec<(&'static str, String)>> {
    let mut tables = Vec::new();
    for infix in TARGET_INFIXES {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT name FROM {} WHERE urllist = ?1",
            target_registry(infix)
        ))?;
        let names = stmt
            .query_map(params![list_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        tables.extend(names.into_iter().map(|n| (infix, n)));
    }
    Ok(tables)
}

fn rename_dependent_tables(
    conn: &Connection,
    website_id: i64,
    old_ns: &str,
    new_ns: &str,
) -> Result<()> {
    for (list_id, list_ns) in list_namespaces(conn, website_id)? {
        let mut renames = vec![
            (list_table(old_ns, &list_ns), list_table(new_ns, &list_ns)),
            (
                crawled_table(old_ns, &list_ns),
                crawled_table(new_ns, &list_ns),
            ),
        ];
        for suffix in LOCK_SUFFIXES {
            renames.push((
                lock_table(old_ns, &list_ns, suffix),
                lock_table(new_ns, &list_ns, suffix),
            ));
        }
        for (infix, name) in registered_target_tables(conn, list_id)? {
            renames.push((
                target_table(old_ns, &list_ns, infix, &name),
                target_table(new_ns, &list_ns, infix, &name),
            ));
        }

        for (from, to) in renames {
            conn.execute(&format!("ALTER TABLE `{from}` RENAME TO `{to}`"), [])?;
        }

        super::urllist::rebuild_list_indexes(
            conn,
            &list_table(old_ns, &list_ns),
            &crawled_table(old_ns, &list_ns),
            &list_table(new_ns, &list_ns),
            &crawled_table(new_ns, &list_ns),
        )?;
    }
    Ok(())
}

pub(super) fn drop_list_tables(
    conn: &Connection,
    website_ns: &str,
    list_ns: &str,
    list_id: i64,
) -> Result<()> {
    for (infix, name) in registered_target_tables(conn, list_id)? {
        conn.execute(
            &format!(
                "DROP TABLE IF EXISTS `{}`",
                target_table(website_ns, list_ns, infix, &name)
            ),
            [],
        )?;
        conn.execute(
            &format!("DELETE FROM {} WHERE urllist = ?1", target_registry(infix)),
            params![list_id],
        )?;
    }
    for suffix in LOCK_SUFFIXES {
        conn.execute(
            &format!(
                "DROP TABLE IF EXISTS `{}`",
                lock_table(website_ns, list_ns, suffix)
            ),
            [],
        )?;
    }
    conn.execute(
        &format!(
            "DROP TABLE IF EXISTS `{}`",
            crawled_table(website_ns, list_ns)
        ),
        [],
    )?;
    conn.execute(
        &format!("DROP TABLE IF EXISTS `{}`", list_table(website_ns, list_ns)),
        [],
    )?;
    Ok(())
}

/// Rewrite stored URL forms when the website changes between cross-domain
/// and domain-scoped.
fn rewrite_url_forms(
    conn: &Connection,
    website_id: i64,
    old: &Website,
    new_domain: Option<&str>,
) -> Result<()> {
    for (list_id, list_ns) in list_namespaces(conn, website_id)? {
        let urls = list_table(&old.namespace, &list_ns);

        match (old.domain.as_deref(), new_domain) {
            (None, Some(domain)) => {
                // Cross-domain to domain-scoped: keep matching hosts as
                // sub-URLs, drop the rest.
                let stripped = domain.strip_prefix("www.").unwrap_or(domain);
                conn.execute(
                    &format!(
                        "UPDATE `{urls}`
                         SET url = SUBSTR(url, INSTR(url, '/')),
                             hash = 0
                         WHERE url LIKE ?1 OR url LIKE ?2"
                    ),
                    params![format!("{stripped}/%"), format!("www.{stripped}/%")],
                )?;

                delete_foreign_urls(conn, &old.namespace, &list_ns, list_id)?;
                rehash_urls(conn, &urls)?;
            }
            (Some(old_domain), None) => {
                // Domain-scoped to cross-domain: prepend the old domain.
                conn.execute(
                    &format!("UPDATE `{urls}` SET url = ?1 || url, hash = 0"),
                    params![old_domain],
                )?;
                rehash_urls(conn, &urls)?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Delete URL rows that did not match the new domain, together with their
/// content, lock, and target rows.
fn delete_foreign_urls(
    conn: &Connection,
    website_ns: &str,
    list_ns: &str,
    list_id: i64,
) -> Result<()> {
    let urls = list_table(website_ns, list_ns);
    let doomed = format!("SELECT id FROM `{urls}` WHERE SUBSTR(url, 1, 1) != '/'");

    conn.execute(
        &format!(
            "DELETE FROM `{}` WHERE url IN ({doomed})",
            crawled_table(website_ns, list_ns)
        ),
        [],
    )?;
    for suffix in LOCK_SUFFIXES {
        conn.execute(
            &format!(
                "DELETE FROM `{}` WHERE url IN ({doomed})",
                lock_table(website_ns, list_ns, suffix)
            ),
            [],
        )?;
    }
    for (infix, name) in registered_target_tables(conn, list_id)? {
        conn.execute(
            &format!(
                "DELETE FROM `{}` WHERE url IN ({doomed})",
                target_table(website_ns, list_ns, infix, &name)
            ),
            [],
        )?;
    }
    conn.execute(
        &format!("DELETE FROM `{urls}` WHERE SUBSTR(url, 1, 1) != '/'"),
        [],
    )?;
    Ok(())
}

/// Recompute the CRC32 hash column after a bulk URL rewrite.
fn rehash_urls(conn: &Connection, urls_table: &str) -> Result<()> {
    let mut stmt = conn.prepare(&format!("SELECT id, url FROM `{urls_table}`"))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    drop(stmt);

    for (id, url) in rows {
        conn.execute(
            &format!("UPDATE `{urls_table}` SET hash = ?1 WHERE id = ?2"),
            params![crc32fast::hash(url.as_bytes()) as i64, id],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::{test_db, UrlListEngine, UrlListRepository};
    use super::*;
    use crate::models::UrlListProps;

    fn props(ns: &str, domain: Option<&str>) -> WebsiteProps {
        WebsiteProps {
            domain: domain.map(str::to_string),
            namespace: ns.to_string(),
            name: format!("{ns} site"),
            data_dir: None,
        }
    }

    #[test]
    fn test_add_and_namespace_conflict() {
        let db = test_db();
        let repo = WebsiteRepository::new(db);

        let id = repo.add(&props("ex", Some("example.com"))).unwrap();
        assert!(id > 0);
        assert!(repo.is_namespace("ex").unwrap());

        let err = repo.add(&props("ex", None)).unwrap_err();
        assert!(matches!(err, StorageError::NamespaceExists(_)));
    }

    #[test]
    fn test_invalid_namespace_rejected() {
        let db = test_db();
        let repo = WebsiteRepository::new(db);
        let err = repo.add(&props("bad ns", None)).unwrap_err();
        assert!(matches!(err, StorageError::Invalid(_)));
    }

    #[test]
    fn test_missing_data_dir_rejected() {
        let db = test_db();
        let repo = WebsiteRepository::new(db);
        let mut p = props("ex", None);
        p.data_dir = Some("/nonexistent/webharvest/data".into());
        let err = repo.add(&p).unwrap_err();
        assert!(matches!(err, StorageError::IncorrectPath(_)));
    }

    #[test]
    fn test_rename_moves_dependent_tables() {
        let db = test_db();
        let sites = WebsiteRepository::new(db.clone());
        let lists = UrlListRepository::new(db.clone());

        let site = sites.add(&props("ex", Some("example.com"))).unwrap();
        lists
            .add(
                site,
                &UrlListProps {
                    namespace: "news".to_string(),
                    name: "News".to_string(),
                },
            )
            .unwrap();

        sites.update(site, &props("renamed", Some("example.com"))).unwrap();

        db.with_conn(|conn| {
            let old: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name LIKE 'webharvest_ex_news%'",
                [],
                |r| r.get(0),
            )?;
            let new: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name LIKE 'webharvest_renamed_news%'",
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
    fn test_change_domain_to_cross_domain_prepends() {
        let db = test_db();
        let sites = WebsiteRepository::new(db.clone());
        let lists = UrlListRepository::new(db.clone());

        let site = sites.add(&props("ex", Some("example.com"))).unwrap();
        lists
            .add(
                site,
                &UrlListProps {
                    namespace: "news".to_string(),
                    name: "News".to_string(),
                },
            )
            .unwrap();

        let engine = UrlListEngine::new(db.clone(), "ex", "news");
        engine.add("/a", true).unwrap();
        engine.add("/b?x=1", true).unwrap();

        sites.change_domain(site, None).unwrap();

        let engine = UrlListEngine::new(db, "ex", "news");
        assert!(engine.exists("example.com/a").unwrap());
        assert!(engine.exists("example.com/b?x=1").unwrap());
        assert!(!engine.exists("/a").unwrap());
    }

    #[test]
    fn test_change_domain_to_scoped_strips_and_filters() {
        let db = test_db();
        let sites = WebsiteRepository::new(db.clone());
        let lists = UrlListRepository::new(db.clone());

        let site = sites.add(&props("x", None)).unwrap();
        lists
            .add(
                site,
                &UrlListProps {
                    namespace: "all".to_string(),
                    name: "All".to_string(),
                },
            )
            .unwrap();

        let engine = UrlListEngine::new(db.clone(), "x", "all");
        engine.add("example.com/a", true).unwrap();
        engine.add("www.example.com/b", true).unwrap();
        engine.add("other.test/c", true).unwrap();

        sites.change_domain(site, Some("example.com")).unwrap();

        let engine = UrlListEngine::new(db, "x", "all");
        assert!(engine.exists("/a").unwrap());
        assert!(engine.exists("/b").unwrap());
        assert!(!engine.exists("other.test/c").unwrap());
        assert_eq!(engine.count().unwrap(), 2);
    }

    #[test]
    fn test_duplicate_website_copies_structure() {
        let db = test_db();
        let sites = WebsiteRepository::new(db.clone());
        let lists = UrlListRepository::new(db.clone());

        let site = sites.add(&props("ex", Some("example.com"))).unwrap();
        lists
            .add(
                site,
                &UrlListProps {
                    namespace: "news".to_string(),
                    name: "News".to_string(),
                },
            )
            .unwrap();

        let copy = sites.duplicate(site).unwrap();
        let copied = sites.get(copy).unwrap();
        assert_eq!(copied.namespace, "ex2");

        db.with_conn(|conn| {
            let tables: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name LIKE 'webharvest_ex2_news%'",
                [],
                |r| r.get(0),
            )?;
            assert_eq!(tables, 6);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_delete_drops_everything() {
        let db = test_db();
        let sites = WebsiteRepository::new(db.clone());
        let lists = UrlListRepository::new(db.clone());

        let site = sites.add(&props("gone", None)).unwrap();
        lists
            .add(
                site,
                &UrlListProps {
                    namespace: "l".to_string(),
                    name: "L".to_string(),
                },
            )
            .unwrap();

        sites.delete(site).unwrap();
        assert!(matches!(
            sites.get(site).unwrap_err(),
            StorageError::NotFound(_)
        ));

        db.with_conn(|conn| {
            let tables: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name LIKE 'webharvest_gone_%'",
                [],
                |r| r.get(0),
            )?;
            assert_eq!(tables, 0);
            Ok(())
        })
        .unwrap();
    }
}

//! End-to-end flows over the storage layer and URL-list engine: the same
//! sequence of operations the worker modules perform, without the network.

use std::sync::Arc;

use tempfile::TempDir;

use webharvest::models::{
    ModuleKind, OversizePolicy, UrlListProps, WebsiteProps,
};
use webharvest::repository::{
    self, ContentRepository, Db, TargetColumn, TargetTableRepository, UrlListEngine,
    UrlListRepository, WebsiteRepository,
};

struct Fixture {
    _dir: TempDir,
    db: Arc<Db>,
    website: i64,
    list: i64,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let db = Db::open(&dir.path().join("store.db"));
    repository::init_schema(&db).unwrap();

    let website = WebsiteRepository::new(db.clone())
        .add(&WebsiteProps {
            domain: Some("example.com".to_string()),
            namespace: "ex".to_string(),
            name: "Example".to_string(),
            data_dir: None,
        })
        .unwrap();
    let list = UrlListRepository::new(db.clone())
        .add(
            website,
            &UrlListProps {
                namespace: "news".to_string(),
                name: "News".to_string(),
            },
        )
        .unwrap();

    Fixture {
        _dir: dir,
        db,
        website,
        list,
    }
}

/// Scenario: crawl one sub-URL. Seed `/a`, run the crawler's transaction
/// by hand, and verify the commit left exactly the expected rows.
#[test]
fn crawl_one_sub_url() {
    let f = fixture();
    let engine = UrlListEngine::new(f.db.clone(), "ex", "news");
    let contents = ContentRepository::new(f.db.clone(), "ex", "news");

    let seeded = engine.add("/a", false).unwrap();
    assert_eq!(seeded, 1);

    // Select, lock, fetch (simulated), save, commit.
    let url = engine.next_for(ModuleKind::Crawler, 0, false).unwrap().unwrap();
    assert_eq!(url.url, "/a");

    let lock = engine.lock(url.id, ModuleKind::Crawler, 300).unwrap().unwrap();
    contents
        .save(url.id, 200, "text/html", "<html>a</html>", OversizePolicy::Error)
        .unwrap();
    assert!(engine.mark_success(url.id, ModuleKind::Crawler, &lock).unwrap());

    // One content row with response 200.
    let row = contents.latest(url.id).unwrap().unwrap();
    assert_eq!(row.response, 200);
    assert!(!row.archived);

    // The lock row shows success with no lock held.
    assert!(engine.is_finished(url.id, ModuleKind::Crawler).unwrap());

    // The next crawler tick finds nothing.
    assert!(engine
        .next_for(ModuleKind::Crawler, url.id, false)
        .unwrap()
        .is_none());
    assert!(engine.next_for(ModuleKind::Crawler, 0, false).unwrap().is_none());
}

/// Scenario: recrawl. With recrawl on, a finished URL is selected again
/// and a second content row is appended; success stays set.
#[test]
fn recrawl_appends_content() {
    let f = fixture();
    let engine = UrlListEngine::new(f.db.clone(), "ex", "news");
    let contents = ContentRepository::new(f.db.clone(), "ex", "news");

    let id = engine.add("/a", false).unwrap();
    let lock = engine.lock(id, ModuleKind::Crawler, 300).unwrap().unwrap();
    contents
        .save(id, 200, "text/html", "first", OversizePolicy::Error)
        .unwrap();
    engine.mark_success(id, ModuleKind::Crawler, &lock).unwrap();

    // Recrawl selects it again.
    let again = engine.next_for(ModuleKind::Crawler, 0, true).unwrap().unwrap();
    assert_eq!(again.id, id);

    let lock = engine.lock(id, ModuleKind::Crawler, 300).unwrap().unwrap();
    contents
        .save(id, 200, "text/html", "second", OversizePolicy::Error)
        .unwrap();
    engine.mark_success(id, ModuleKind::Crawler, &lock).unwrap();

    assert_eq!(contents.count(id).unwrap(), 2);
    assert!(engine.is_finished(id, ModuleKind::Crawler).unwrap());
}

/// Scenario: lock contention between two crawler workers, each with its
/// own connection. Neither sees the other's URL while held; a stale
/// holder cannot commit.
#[test]
fn lock_contention_between_workers() {
    let f = fixture();
    // Two workers, each with its own connection to the same store.
    let worker_a = UrlListEngine::new(f.db.reopen(), "ex", "news");
    let worker_b = UrlListEngine::new(f.db.reopen(), "ex", "news");

    worker_a.add("/a", false).unwrap();
    worker_a.add("/b", false).unwrap();

    let first = worker_a.next_for(ModuleKind::Crawler, 0, false).unwrap().unwrap();
    let lock_a = worker_a
        .lock(first.id, ModuleKind::Crawler, 300)
        .unwrap()
        .unwrap();

    // Worker B does not see the held URL and takes the next one.
    let second = worker_b.next_for(ModuleKind::Crawler, 0, false).unwrap().unwrap();
    assert_ne!(second.id, first.id);
    let lock_b = worker_b
        .lock(second.id, ModuleKind::Crawler, 300)
        .unwrap()
        .unwrap();

    // Nothing is left to select while both are held.
    assert!(worker_a.next_for(ModuleKind::Crawler, 0, false).unwrap().is_none());

    // B cannot take or commit A's URL.
    assert!(worker_b.lock(first.id, ModuleKind::Crawler, 300).unwrap().is_none());
    assert!(!worker_b
        .mark_success(first.id, ModuleKind::Crawler, &lock_b)
        .unwrap());

    // A commits its own.
    assert!(worker_a
        .mark_success(first.id, ModuleKind::Crawler, &lock_a)
        .unwrap());
}

/// Scenario: lock expiry hands the URL over. A renewal with the old
/// locktime then fails, and the original holder cannot commit.
#[test]
fn expired_lock_taken_over() {
    let f = fixture();
    let worker_a = UrlListEngine::new(f.db.reopen(), "ex", "news");
    let worker_b = UrlListEngine::new(f.db.reopen(), "ex", "news");

    let id = worker_a.add("/a", false).unwrap();

    // A takes a lock that expires immediately.
    let lock_a = worker_a.lock(id, ModuleKind::Crawler, 0).unwrap().unwrap();
    std::thread::sleep(std::time::Duration::from_millis(5));

    // B takes over after expiry.
    let lock_b = worker_b.lock(id, ModuleKind::Crawler, 300).unwrap().unwrap();

    // A's renewal and commit both fail against B's lock.
    assert!(worker_a
        .try_renew(id, ModuleKind::Crawler, &lock_a, 300)
        .unwrap()
        .is_none());
    assert!(!worker_a.mark_success(id, ModuleKind::Crawler, &lock_a).unwrap());

    assert!(worker_b.mark_success(id, ModuleKind::Crawler, &lock_b).unwrap());
}

/// Parser-style flow: URLs become eligible once content exists; the write
/// lands in the target table before the success mark.
#[test]
fn parse_after_crawl() {
    let f = fixture();
    let engine = UrlListEngine::new(f.db.clone(), "ex", "news");
    let contents = ContentRepository::new(f.db.clone(), "ex", "news");
    let targets = TargetTableRepository::new(f.db.clone());

    let id = engine.add("/article/1", false).unwrap();
    let crawled = "webharvest_ex_news_crawled";

    // Nothing to parse before content exists.
    assert!(engine
        .next_for_with_content(ModuleKind::Parser, 0, false, false, crawled)
        .unwrap()
        .is_none());

    let lock = engine.lock(id, ModuleKind::Crawler, 300).unwrap().unwrap();
    contents
        .save(
            id,
            200,
            "text/html",
            r#"<article id="42">text</article>"#,
            OversizePolicy::Error,
        )
        .unwrap();
    engine.mark_success(id, ModuleKind::Crawler, &lock).unwrap();

    // Now the parser selects it.
    let url = engine
        .next_for_with_content(ModuleKind::Parser, 0, false, false, crawled)
        .unwrap()
        .unwrap();
    assert_eq!(url.id, id);

    let lock = engine.lock(id, ModuleKind::Parser, 300).unwrap().unwrap();

    let (_, table) = targets
        .add_or_get(
            ModuleKind::Parser,
            f.website,
            f.list,
            "ex",
            "news",
            "articles",
            &[
                TargetColumn::new("parsed_id", "TEXT"),
                TargetColumn::new("parsed_datetime", "TEXT"),
            ],
            false,
        )
        .unwrap();

    targets
        .upsert_row(
            &table,
            id,
            &[
                ("parsed_id".to_string(), Some("42".to_string())),
                (
                    "parsed_datetime".to_string(),
                    Some("2024-01-02T03:04:05".to_string()),
                ),
            ],
        )
        .unwrap();
    assert!(engine.mark_success(id, ModuleKind::Parser, &lock).unwrap());

    assert_eq!(
        targets.value_for_url(&table, "parsed_id", id).unwrap(),
        Some("42".to_string())
    );

    // The crawler's success state is independent of the parser's.
    assert!(engine.is_finished(id, ModuleKind::Crawler).unwrap());
    assert!(engine.is_finished(id, ModuleKind::Parser).unwrap());
}

/// Renaming a website keeps all data reachable under the new namespace.
#[test]
fn rename_preserves_data() {
    let f = fixture();
    let engine = UrlListEngine::new(f.db.clone(), "ex", "news");
    let contents = ContentRepository::new(f.db.clone(), "ex", "news");

    let id = engine.add("/a", false).unwrap();
    contents
        .save(id, 200, "text/html", "body", OversizePolicy::Error)
        .unwrap();

    WebsiteRepository::new(f.db.clone())
        .update(
            f.website,
            &WebsiteProps {
                domain: Some("example.com".to_string()),
                namespace: "moved".to_string(),
                name: "Example".to_string(),
                data_dir: None,
            },
        )
        .unwrap();

    let engine = UrlListEngine::new(f.db.clone(), "moved", "news");
    let contents = ContentRepository::new(f.db.clone(), "moved", "news");
    assert!(engine.exists("/a").unwrap());
    assert_eq!(contents.latest(id).unwrap().unwrap().content, "body");
}

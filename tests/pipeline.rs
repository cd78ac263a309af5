//! End-to-end tests for the ingestion pipeline: fetch, resolve, parse,
//! upsert and outcome bookkeeping against a mock feed host.
//!
//! Single-podcast scenarios use an in-memory SQLite database. Worker pool
//! scenarios, and any that touch the schema from a second connection, use a
//! temporary file so concurrent writers wait on the busy timeout instead of
//! failing.

use chrono::{TimeDelta, Utc};
use pretty_assertions::assert_eq;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Connection, SqliteConnection};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use podfeed::feed::{
    build_client, run_batch, update_podcast, FetchOptions, UpdateContext, UpdateResult,
    MAX_RETRIES,
};
use podfeed::storage::{CategoryCache, Database, FeedStatus, Podcast, Session};
use podfeed::util::{StopWordTokenizer, Tokenizer};

// ============================================================================
// Fixtures
// ============================================================================

fn item(guid: &str, title: &str, day: u32) -> String {
    format!(
        r#"<item>
  <title>{title}</title>
  <guid>{guid}</guid>
  <pubDate>{day:02} May 2024 10:00:00 GMT</pubDate>
  <enclosure url="https://cdn.example.com/{guid}.mp3" type="audio/mpeg" length="1234"/>
  <itunes:duration>45:10</itunes:duration>
</item>"#
    )
}

fn rss(channel_extra: &str, items: &[String]) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:itunes="http://www.itunes.com/dtds/podcast-1.0.dtd">
<channel>
  <title>Pipeline Cast</title>
  <link>https://pipeline.example.com</link>
  <description>Weekly conversations about distributed systems</description>
  <language>en</language>
  <itunes:category text="Technology"/>
  {channel_extra}
  {}
</channel>
</rss>"#,
        items.join("\n")
    )
}

fn three_items() -> Vec<String> {
    vec![
        item("ep-3", "Consensus", 21),
        item("ep-2", "Replication", 14),
        item("ep-1", "Clocks", 7),
    ]
}

async fn context(db: &Database) -> UpdateContext {
    UpdateContext {
        client: build_client("podfeed-test/1.0").unwrap(),
        fetch_options: FetchOptions::default(),
        tokenizer: Box::new(StopWordTokenizer::default()),
        categories: CategoryCache::load(db).await.unwrap(),
    }
}

/// File-backed database for scenarios with more than one connection.
async fn temp_database(tag: &str) -> (Database, PathBuf) {
    let db_path = std::env::temp_dir().join(format!("podfeed-{}-{}.db", tag, std::process::id()));
    let _ = std::fs::remove_file(&db_path);
    let db = Database::open_with_connections(db_path.to_str().unwrap(), 4)
        .await
        .unwrap();
    (db, db_path)
}

async fn mount_status(server: &MockServer, route: &str, status: u16) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

struct PanickingTokenizer;

impl Tokenizer for PanickingTokenizer {
    fn tokenize(&self, _language: &str, _text: &str) -> String {
        panic!("tokenizer blew up");
    }
}

async fn load(db: &Database, id: i64) -> Podcast {
    db.get_podcast(id).await.unwrap().unwrap()
}

async fn run_once(ctx: &UpdateContext, session: &mut Session, db: &Database, id: i64) -> UpdateResult {
    let podcast = load(db, id).await;
    update_podcast(ctx, session, &podcast, Utc::now()).await
}

async fn mount_feed(server: &MockServer, route: &str, body: String) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(body)
                .insert_header("content-type", "application/rss+xml")
                .insert_header("etag", "\"v1\""),
        )
        .mount(server)
        .await;
}

// ============================================================================
// Success and Idempotence
// ============================================================================

#[tokio::test]
async fn test_first_run_stores_feed_then_second_run_is_not_modified() {
    let server = MockServer::start().await;
    mount_feed(&server, "/feed.xml", rss("", &three_items())).await;

    let db = Database::open(":memory:").await.unwrap();
    let ctx = context(&db).await;
    let id = db
        .add_podcast(&format!("{}/feed.xml", server.uri()))
        .await
        .unwrap();
    let mut session = db.session().await.unwrap();

    let first = run_once(&ctx, &mut session, &db, id).await;
    assert_eq!(first.status, FeedStatus::Success);
    assert_eq!(first.stats.map(|s| s.inserted), Some(3));

    let podcast = load(&db, id).await;
    assert!(podcast.active);
    assert_eq!(podcast.title, "Pipeline Cast");
    assert_eq!(podcast.num_episodes, 3);
    assert_eq!(podcast.etag.as_deref(), Some("\"v1\""));
    assert!(!podcast.content_hash.as_deref().unwrap_or_default().is_empty());
    assert!(podcast.extracted_text.contains("consensus"));
    assert!(podcast.parsed.is_some());
    // Weekly cadence, within the persisted bounds
    assert_eq!(podcast.frequency.map(|f| f.num_days()), Some(3));

    let categories = db.get_podcast_categories(id).await.unwrap();
    assert_eq!(
        categories.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
        vec!["Technology"]
    );

    let before = db.get_episodes(id).await.unwrap();

    let second = run_once(&ctx, &mut session, &db, id).await;
    assert_eq!(second.status, FeedStatus::NotModified);
    assert_eq!(second.stats, None);

    let after = db.get_episodes(id).await.unwrap();
    assert_eq!(before, after);
    let podcast = load(&db, id).await;
    assert_eq!(podcast.feed_status, Some(FeedStatus::NotModified));
    assert_eq!(podcast.num_retries, 0);
    assert!(podcast.active);
}

#[tokio::test]
async fn test_changed_feed_diffs_episodes() {
    let server = MockServer::start().await;
    let db = Database::open(":memory:").await.unwrap();
    let ctx = context(&db).await;
    let id = db
        .add_podcast(&format!("{}/feed.xml", server.uri()))
        .await
        .unwrap();
    let mut session = db.session().await.unwrap();

    mount_feed(&server, "/feed.xml", rss("", &three_items())).await;
    run_once(&ctx, &mut session, &db, id).await;
    let original = db.get_episodes(id).await.unwrap();
    let kept_id = original.iter().find(|e| e.guid == "ep-2").unwrap().id;

    server.reset().await;
    mount_feed(
        &server,
        "/feed.xml",
        rss(
            "",
            &[
                item("ep-4", "Sharding", 28),
                item("ep-3", "Consensus", 21),
                item("ep-2", "Replication, revisited", 14),
            ],
        ),
    )
    .await;

    let result = run_once(&ctx, &mut session, &db, id).await;
    assert_eq!(result.status, FeedStatus::Success);
    let stats = result.stats.unwrap();
    assert_eq!((stats.inserted, stats.updated, stats.deleted), (1, 2, 1));

    let episodes = db.get_episodes(id).await.unwrap();
    let guids: Vec<&str> = episodes.iter().map(|e| e.guid.as_str()).collect();
    assert_eq!(guids, vec!["ep-4", "ep-3", "ep-2"]);
    let kept = episodes.iter().find(|e| e.guid == "ep-2").unwrap();
    assert_eq!(kept.id, kept_id);
    assert_eq!(kept.title, "Replication, revisited");
    assert_eq!(load(&db, id).await.num_episodes, 3);
}

#[tokio::test]
async fn test_one_bad_date_drops_one_item() {
    let server = MockServer::start().await;
    let mut items: Vec<String> = (1..=19).map(|d| item(&format!("ep-{d}"), "Episode", d)).collect();
    items.push(
        r#"<item><title>Broken</title><guid>broken</guid><pubDate>not a date</pubDate>
<enclosure url="https://cdn.example.com/broken.mp3" type="audio/mpeg"/></item>"#
            .to_string(),
    );
    mount_feed(&server, "/feed.xml", rss("", &items)).await;

    let db = Database::open(":memory:").await.unwrap();
    let ctx = context(&db).await;
    let id = db
        .add_podcast(&format!("{}/feed.xml", server.uri()))
        .await
        .unwrap();
    let mut session = db.session().await.unwrap();

    let result = run_once(&ctx, &mut session, &db, id).await;
    assert_eq!(result.status, FeedStatus::Success);
    assert_eq!(db.get_episodes(id).await.unwrap().len(), 19);
}

#[tokio::test]
async fn test_complete_feed_is_deactivated_after_success() {
    let server = MockServer::start().await;
    mount_feed(
        &server,
        "/feed.xml",
        rss("<itunes:complete>Yes</itunes:complete>", &three_items()),
    )
    .await;

    let db = Database::open(":memory:").await.unwrap();
    let ctx = context(&db).await;
    let id = db
        .add_podcast(&format!("{}/feed.xml", server.uri()))
        .await
        .unwrap();
    let mut session = db.session().await.unwrap();

    let result = run_once(&ctx, &mut session, &db, id).await;
    assert_eq!(result.status, FeedStatus::Success);
    let podcast = load(&db, id).await;
    assert!(!podcast.active);
    assert_eq!(podcast.num_episodes, 3);
}

// ============================================================================
// Duplicates and Moves
// ============================================================================

#[tokio::test]
async fn test_identical_body_is_duplicate_of_first() {
    let server = MockServer::start().await;
    let body = rss("", &three_items());
    mount_feed(&server, "/a.xml", body.clone()).await;
    mount_feed(&server, "/b.xml", body).await;

    let db = Database::open(":memory:").await.unwrap();
    let ctx = context(&db).await;
    let first = db.add_podcast(&format!("{}/a.xml", server.uri())).await.unwrap();
    let second = db.add_podcast(&format!("{}/b.xml", server.uri())).await.unwrap();
    let mut session = db.session().await.unwrap();

    assert_eq!(run_once(&ctx, &mut session, &db, first).await.status, FeedStatus::Success);
    let result = run_once(&ctx, &mut session, &db, second).await;
    assert_eq!(result.status, FeedStatus::Duplicate);

    let duplicate = load(&db, second).await;
    assert!(!duplicate.active);
    assert_eq!(duplicate.canonical, Some(first));
    assert!(db.get_episodes(second).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_redirect_onto_existing_feed_is_duplicate() {
    let server = MockServer::start().await;
    let target = format!("{}/feed.xml", server.uri());
    mount_feed(&server, "/feed.xml", rss("", &three_items())).await;
    Mock::given(method("GET"))
        .and(path("/old.xml"))
        .respond_with(ResponseTemplate::new(301).insert_header("location", target.as_str()))
        .mount(&server)
        .await;

    let db = Database::open(":memory:").await.unwrap();
    let ctx = context(&db).await;
    let existing = db.add_podcast(&target).await.unwrap();
    let moved = db
        .add_podcast(&format!("{}/old.xml", server.uri()))
        .await
        .unwrap();
    let mut session = db.session().await.unwrap();

    let result = run_once(&ctx, &mut session, &db, moved).await;
    assert_eq!(result.status, FeedStatus::Duplicate);
    let podcast = load(&db, moved).await;
    assert!(!podcast.active);
    assert_eq!(podcast.canonical, Some(existing));
}

#[tokio::test]
async fn test_redirect_to_unclaimed_url_moves_podcast() {
    let server = MockServer::start().await;
    let target = format!("{}/feed.xml", server.uri());
    mount_feed(&server, "/feed.xml", rss("", &three_items())).await;
    Mock::given(method("GET"))
        .and(path("/old.xml"))
        .respond_with(ResponseTemplate::new(301).insert_header("location", target.as_str()))
        .mount(&server)
        .await;

    let db = Database::open(":memory:").await.unwrap();
    let ctx = context(&db).await;
    let id = db
        .add_podcast(&format!("{}/old.xml", server.uri()))
        .await
        .unwrap();
    let mut session = db.session().await.unwrap();

    let result = run_once(&ctx, &mut session, &db, id).await;
    assert_eq!(result.status, FeedStatus::Success);
    assert_eq!(load(&db, id).await.rss, target);
}

#[tokio::test]
async fn test_declared_new_feed_url_moves_podcast() {
    let server = MockServer::start().await;
    let declared = format!("{}/new.xml", server.uri());
    mount_feed(
        &server,
        "/feed.xml",
        rss(
            &format!("<itunes:new-feed-url>{}</itunes:new-feed-url>", declared),
            &three_items(),
        ),
    )
    .await;

    let db = Database::open(":memory:").await.unwrap();
    let ctx = context(&db).await;
    let id = db
        .add_podcast(&format!("{}/feed.xml", server.uri()))
        .await
        .unwrap();
    let mut session = db.session().await.unwrap();

    assert_eq!(run_once(&ctx, &mut session, &db, id).await.status, FeedStatus::Success);
    assert_eq!(load(&db, id).await.rss, declared);
}

#[tokio::test]
async fn test_declared_new_feed_url_of_existing_podcast_is_duplicate() {
    let server = MockServer::start().await;
    let declared = format!("{}/new.xml", server.uri());
    mount_feed(
        &server,
        "/feed.xml",
        rss(
            &format!("<itunes:new-feed-url>{}</itunes:new-feed-url>", declared),
            &three_items(),
        ),
    )
    .await;

    let db = Database::open(":memory:").await.unwrap();
    let ctx = context(&db).await;
    let existing = db.add_podcast(&declared).await.unwrap();
    let id = db
        .add_podcast(&format!("{}/feed.xml", server.uri()))
        .await
        .unwrap();
    let mut session = db.session().await.unwrap();

    let result = run_once(&ctx, &mut session, &db, id).await;
    assert_eq!(result.status, FeedStatus::Duplicate);
    assert_eq!(result.stats, None);

    let podcast = load(&db, id).await;
    assert!(!podcast.active);
    assert_eq!(podcast.canonical, Some(existing));
    assert_eq!(podcast.rss, format!("{}/feed.xml", server.uri()));
    assert!(db.get_episodes(id).await.unwrap().is_empty());
    assert!(load(&db, existing).await.active);
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_gone_feed_is_discontinued() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&server)
        .await;

    let db = Database::open(":memory:").await.unwrap();
    let ctx = context(&db).await;
    let id = db
        .add_podcast(&format!("{}/feed.xml", server.uri()))
        .await
        .unwrap();
    let mut session = db.session().await.unwrap();

    let result = run_once(&ctx, &mut session, &db, id).await;
    assert_eq!(result.status, FeedStatus::Discontinued);

    let podcast = load(&db, id).await;
    assert!(!podcast.active);
    assert!(podcast.parsed.is_some());
    assert_eq!(podcast.feed_status, Some(FeedStatus::Discontinued));
    assert!(db.get_episodes(id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_retry_exhaustion_deactivates() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let db = Database::open(":memory:").await.unwrap();
    let ctx = context(&db).await;
    let id = db
        .add_podcast(&format!("{}/feed.xml", server.uri()))
        .await
        .unwrap();
    let mut session = db.session().await.unwrap();

    let mut last_frequency = None;
    for attempt in 1..MAX_RETRIES {
        let result = run_once(&ctx, &mut session, &db, id).await;
        assert_eq!(result.status, FeedStatus::Unavailable);

        let podcast = load(&db, id).await;
        assert!(podcast.active, "still active after {} failures", attempt);
        assert_eq!(podcast.num_retries, attempt);
        assert!(podcast.exception.contains("503"));
        assert!(podcast.frequency >= last_frequency);
        last_frequency = podcast.frequency;
    }

    run_once(&ctx, &mut session, &db, id).await;
    let podcast = load(&db, id).await;
    assert_eq!(podcast.num_retries, MAX_RETRIES);
    assert!(!podcast.active);
}

#[tokio::test]
async fn test_garbage_body_is_invalid_rss() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html><body>Not a feed</body></html>"))
        .mount(&server)
        .await;

    let db = Database::open(":memory:").await.unwrap();
    let ctx = context(&db).await;
    let id = db
        .add_podcast(&format!("{}/feed.xml", server.uri()))
        .await
        .unwrap();
    let mut session = db.session().await.unwrap();

    let result = run_once(&ctx, &mut session, &db, id).await;
    assert_eq!(result.status, FeedStatus::InvalidRss);
    let podcast = load(&db, id).await;
    assert!(podcast.active);
    assert_eq!(podcast.num_retries, 1);
    assert!(!podcast.exception.is_empty());
}

#[tokio::test]
async fn test_failed_upsert_is_recorded_as_database_error() {
    let server = MockServer::start().await;
    mount_status(&server, "/feed.xml", 503).await;

    let (db, db_path) = temp_database("upsert-failure").await;
    let ctx = context(&db).await;
    let id = db
        .add_podcast(&format!("{}/feed.xml", server.uri()))
        .await
        .unwrap();
    let mut session = db.session().await.unwrap();

    assert_eq!(
        run_once(&ctx, &mut session, &db, id).await.status,
        FeedStatus::Unavailable
    );
    assert_eq!(load(&db, id).await.num_retries, 1);

    server.reset().await;
    mount_feed(&server, "/feed.xml", rss("", &three_items())).await;

    // Any episode write now aborts the upsert transaction
    let options = SqliteConnectOptions::new().filename(&db_path);
    let mut conn = SqliteConnection::connect_with(&options).await.unwrap();
    sqlx::query(
        "CREATE TRIGGER reject_episodes BEFORE INSERT ON episodes \
         BEGIN SELECT RAISE(ABORT, 'episodes are read-only'); END",
    )
    .execute(&mut conn)
    .await
    .unwrap();
    conn.close().await.unwrap();

    let result = run_once(&ctx, &mut session, &db, id).await;
    assert_eq!(result.status, FeedStatus::DatabaseError);
    assert_eq!(result.stats, None);

    let podcast = load(&db, id).await;
    assert_eq!(podcast.feed_status, Some(FeedStatus::DatabaseError));
    assert_eq!(podcast.num_retries, 1);
    assert!(podcast.active);
    assert!(podcast.exception.contains("episodes are read-only"));
    assert!(podcast.frequency >= Some(TimeDelta::hours(1)));
    assert!(podcast.frequency <= Some(TimeDelta::days(3)));
    // Nothing from the failed upsert is visible
    assert!(db.get_episodes(id).await.unwrap().is_empty());
    assert_eq!(podcast.num_episodes, 0);
    assert_eq!(podcast.title, "");

    drop(session);
    drop(db);
    let _ = std::fs::remove_file(&db_path);
}

// ============================================================================
// Worker Pool
// ============================================================================

#[tokio::test]
async fn test_batch_runs_every_due_podcast() {
    let server = MockServer::start().await;
    for n in 0..6 {
        let items = vec![item(&format!("show{n}-ep"), "Episode", 10 + n)];
        mount_feed(&server, &format!("/show{n}.xml"), rss("", &items)).await;
    }
    mount_status(&server, "/gone.xml", 410).await;

    let (db, db_path) = temp_database("pool").await;

    for n in 0..6 {
        db.add_podcast(&format!("{}/show{n}.xml", server.uri()))
            .await
            .unwrap();
    }
    let gone = db
        .add_podcast(&format!("{}/gone.xml", server.uri()))
        .await
        .unwrap();

    let due = db.find_due(100, Utc::now()).await.unwrap();
    assert_eq!(due.len(), 7);

    let ctx = Arc::new(context(&db).await);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let summary = run_batch(&db, due, ctx, 3, Some(tx)).await;

    assert_eq!(summary.total(), 7);
    assert_eq!(summary.count(FeedStatus::Success), 6);
    assert_eq!(summary.count(FeedStatus::Discontinued), 1);

    let mut streamed = Vec::new();
    while let Some(result) = rx.recv().await {
        streamed.push(result);
    }
    assert_eq!(streamed.len(), 7);
    assert!(streamed
        .iter()
        .any(|r| r.podcast_id == gone && r.status == FeedStatus::Discontinued));

    // Nothing is due right after a successful batch
    assert!(db.find_due(100, Utc::now()).await.unwrap().is_empty());

    drop(db);
    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn test_unread_result_stream_does_not_stall_batch() {
    let server = MockServer::start().await;
    let (db, db_path) = temp_database("unread-stream").await;
    for n in 0..8 {
        let route = format!("/gone{n}.xml");
        mount_status(&server, &route, 410).await;
        db.add_podcast(&format!("{}{}", server.uri(), route))
            .await
            .unwrap();
    }

    let due = db.find_due(100, Utc::now()).await.unwrap();
    let ctx = Arc::new(context(&db).await);
    // The receiver stays alive but is only drained after the batch
    let (tx, mut rx) = mpsc::unbounded_channel();
    let summary = tokio::time::timeout(Duration::from_secs(30), run_batch(&db, due, ctx, 2, Some(tx)))
        .await
        .expect("batch finished without anyone reading results");
    assert_eq!(summary.count(FeedStatus::Discontinued), 8);

    let mut streamed = 0;
    while rx.recv().await.is_some() {
        streamed += 1;
    }
    assert_eq!(streamed, 8);

    drop(db);
    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn test_panicking_run_is_recorded_and_batch_continues() {
    let server = MockServer::start().await;
    mount_status(&server, "/boom.xml", 503).await;
    mount_status(&server, "/gone.xml", 410).await;

    let (db, db_path) = temp_database("panic").await;
    let boom = db
        .add_podcast(&format!("{}/boom.xml", server.uri()))
        .await
        .unwrap();
    let gone = db
        .add_podcast(&format!("{}/gone.xml", server.uri()))
        .await
        .unwrap();

    {
        let ctx = context(&db).await;
        let mut session = db.session().await.unwrap();
        run_once(&ctx, &mut session, &db, boom).await;
    }
    assert_eq!(load(&db, boom).await.num_retries, 1);

    server.reset().await;
    mount_feed(&server, "/boom.xml", rss("", &three_items())).await;
    mount_status(&server, "/gone.xml", 410).await;

    let mut ctx = context(&db).await;
    ctx.tokenizer = Box::new(PanickingTokenizer);
    let batch = vec![load(&db, boom).await, load(&db, gone).await];

    // One worker, so the panicked run and the next one share a connection
    let summary = run_batch(&db, batch, Arc::new(ctx), 1, None).await;
    assert_eq!(summary.total(), 2);
    assert_eq!(summary.count(FeedStatus::DatabaseError), 1);
    assert_eq!(summary.count(FeedStatus::Discontinued), 1);

    let podcast = load(&db, boom).await;
    assert_eq!(podcast.feed_status, Some(FeedStatus::DatabaseError));
    assert_eq!(podcast.num_retries, 1);
    assert!(podcast.active);
    assert!(podcast.exception.starts_with("panic: "));
    assert!(podcast.exception.contains("tokenizer blew up"));
    assert!(db.get_episodes(boom).await.unwrap().is_empty());

    let podcast = load(&db, gone).await;
    assert_eq!(podcast.feed_status, Some(FeedStatus::Discontinued));
    assert!(!podcast.active);

    drop(db);
    let _ = std::fs::remove_file(&db_path);
}

//! Per-podcast update run: fetch, resolve, parse, schedule and persist.
//!
//! Every run ends in exactly one terminal write. A successful parse writes
//! episodes, categories, podcast fields and the outcome together inside
//! [`Session::apply_feed`]; every other outcome is a single
//! [`Session::record_outcome`].

use chrono::{DateTime, Utc};

use super::fetcher::{fetch, FetchError, FetchOptions, FetchedFeed};
use super::models::Feed;
use super::parser::{parse_feed_at, ParseError};
use super::resolver::{resolve_content_hash, resolve_url, ResolveError};
use super::scheduler::{clamp_frequency, reschedule, schedule};
use crate::storage::{
    CacheValidators, CategoryCache, DatabaseError, FeedStatus, OutcomeUpdate, Podcast, Session,
    UpsertStats,
};
use crate::util::Tokenizer;

/// Consecutive transient failures before a podcast is deactivated.
pub const MAX_RETRIES: u32 = 12;

/// Everything a run needs besides its podcast and connection.
///
/// Built once per batch and shared read-only by every worker.
pub struct UpdateContext {
    pub client: reqwest::Client,
    pub fetch_options: FetchOptions,
    pub tokenizer: Box<dyn Tokenizer>,
    pub categories: CategoryCache,
}

/// What one run did, as reported to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateResult {
    pub podcast_id: i64,
    pub status: FeedStatus,
    /// Episode row changes; `Some` only on `Success`.
    pub stats: Option<UpsertStats>,
}

/// Why a run stopped short of a successful upsert.
#[derive(Debug)]
pub(crate) enum Failure {
    NotModified,
    Discontinued,
    Duplicate(i64),
    Unavailable(String),
    InvalidRss(String),
    Database(String),
}

impl Failure {
    fn status(&self) -> FeedStatus {
        match self {
            Self::NotModified => FeedStatus::NotModified,
            Self::Discontinued => FeedStatus::Discontinued,
            Self::Duplicate(_) => FeedStatus::Duplicate,
            Self::Unavailable(_) => FeedStatus::Unavailable,
            Self::InvalidRss(_) => FeedStatus::InvalidRss,
            Self::Database(_) => FeedStatus::DatabaseError,
        }
    }
}

impl From<FetchError> for Failure {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::NotModified => Self::NotModified,
            FetchError::Discontinued => Self::Discontinued,
            FetchError::Unavailable(reason) => Self::Unavailable(reason.to_string()),
        }
    }
}

impl From<ResolveError> for Failure {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::Duplicate(root) => Self::Duplicate(root),
            ResolveError::Database(e) => Self::Database(e.to_string()),
        }
    }
}

impl From<ParseError> for Failure {
    fn from(err: ParseError) -> Self {
        Self::InvalidRss(err.to_string())
    }
}

impl From<DatabaseError> for Failure {
    fn from(err: DatabaseError) -> Self {
        Self::Database(err.to_string())
    }
}

/// Run the full update state machine for one podcast.
///
/// `podcast` is the row as loaded for the batch; it is never re-read.
/// Failures are converted into the podcast's persisted state and never
/// returned. Only the resulting status reaches the caller.
pub async fn update_podcast(
    ctx: &UpdateContext,
    session: &mut Session,
    podcast: &Podcast,
    now: DateTime<Utc>,
) -> UpdateResult {
    match run(ctx, session, podcast, now).await {
        Ok(stats) => {
            tracing::info!(
                podcast_id = podcast.id,
                status = %FeedStatus::Success,
                inserted = stats.inserted,
                updated = stats.updated,
                deleted = stats.deleted,
                "Podcast updated"
            );
            UpdateResult {
                podcast_id: podcast.id,
                status: FeedStatus::Success,
                stats: Some(stats),
            }
        }
        Err(failure) => record_failure(session, podcast, failure, now).await,
    }
}

async fn run(
    ctx: &UpdateContext,
    session: &mut Session,
    podcast: &Podcast,
    now: DateTime<Utc>,
) -> Result<UpsertStats, Failure> {
    let fetched = fetch(&ctx.client, podcast, ctx.fetch_options).await?;

    let mut rss = podcast.rss.clone();
    if let Some(moved) = resolve_url(session, podcast.id, &rss, &fetched.final_url).await? {
        rss = moved;
    }
    resolve_content_hash(session, podcast.id, &fetched.content_hash).await?;

    let feed = parse_feed_at(&fetched.body, now)?;

    if let Some(declared) = feed.canonical_url.as_deref() {
        if let Some(moved) = resolve_url(session, podcast.id, &rss, declared).await? {
            rss = moved;
        }
    }

    let outcome = success_outcome(podcast, &feed, &fetched, rss, now);
    let extracted_text = ctx.tokenizer.tokenize(&feed.language, &feed.token_source());
    let category_ids = ctx.categories.matching(&feed.categories);

    let stats = session
        .apply_feed(podcast.id, &feed, &extracted_text, &category_ids, &outcome)
        .await?;
    Ok(stats)
}

fn success_outcome(
    podcast: &Podcast,
    feed: &Feed,
    fetched: &FetchedFeed,
    rss: String,
    now: DateTime<Utc>,
) -> OutcomeUpdate {
    let mut outcome = OutcomeUpdate::new(
        FeedStatus::Success,
        now,
        clamp_frequency(schedule(&feed.item_dates(), now)),
    );
    outcome.active = !feed.complete;
    outcome.rss = (rss != podcast.rss).then_some(rss);
    outcome.validators = Some(CacheValidators {
        etag: fetched.etag.clone(),
        modified: fetched.modified,
        content_hash: fetched.content_hash.clone(),
    });
    outcome
}

/// Terminal state for a run that did not end in a successful upsert.
pub(crate) fn failure_outcome(
    podcast: &Podcast,
    failure: &Failure,
    now: DateTime<Utc>,
) -> OutcomeUpdate {
    let widened = clamp_frequency(reschedule(podcast.pub_date, podcast.frequency, now));
    let mut outcome = OutcomeUpdate::new(failure.status(), now, widened);
    outcome.active = podcast.active;
    outcome.num_retries = podcast.num_retries;

    match failure {
        Failure::NotModified => {
            outcome.num_retries = 0;
        }
        Failure::Discontinued => {
            outcome.active = false;
            outcome.exception = "Feed discontinued (HTTP 410)".to_string();
        }
        Failure::Duplicate(root) => {
            outcome.active = false;
            outcome.canonical = Some(*root);
        }
        Failure::Unavailable(reason) | Failure::InvalidRss(reason) => {
            outcome.num_retries = podcast.num_retries.saturating_add(1);
            if outcome.num_retries >= MAX_RETRIES {
                outcome.active = false;
            }
            outcome.exception = reason.clone();
        }
        Failure::Database(reason) => {
            outcome.exception = reason.clone();
        }
    }
    outcome
}

/// Persist a failed run and report it.
///
/// A failing persist is logged and reported as `DatabaseError`.
pub(crate) async fn record_failure(
    session: &mut Session,
    podcast: &Podcast,
    failure: Failure,
    now: DateTime<Utc>,
) -> UpdateResult {
    let outcome = failure_outcome(podcast, &failure, now);
    let mut status = outcome.status;

    match &failure {
        Failure::NotModified => {
            tracing::info!(podcast_id = podcast.id, status = %status, "Podcast not modified");
        }
        Failure::Duplicate(root) => {
            tracing::warn!(podcast_id = podcast.id, status = %status, canonical = root, "Duplicate podcast deactivated");
        }
        _ => {
            tracing::warn!(
                podcast_id = podcast.id,
                status = %status,
                num_retries = outcome.num_retries,
                active = outcome.active,
                exception = %outcome.exception,
                "Podcast update failed"
            );
        }
    }

    if let Err(e) = session.record_outcome(podcast.id, &outcome).await {
        tracing::error!(podcast_id = podcast.id, error = %e, "Failed to record update outcome");
        status = FeedStatus::DatabaseError;
    }

    UpdateResult {
        podcast_id: podcast.id,
        status,
        stats: None,
    }
}

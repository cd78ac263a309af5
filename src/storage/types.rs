use chrono::{DateTime, TimeDelta, Utc};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::feed::{EpisodeType, PodcastType};

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// The database stayed locked past the busy timeout
    #[error("Database is busy: {0}")]
    Busy(String),

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// A stored value could not be decoded
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Classify lock contention separately from other sqlx failures
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5): database is locked
        // SQLITE_LOCKED (6): database table is locked
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
        {
            return DatabaseError::Busy(err.to_string());
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Feed Status
// ============================================================================

/// Outcome of the most recent update run, persisted as `feed_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FeedStatus {
    Success,
    NotModified,
    Discontinued,
    Duplicate,
    InvalidRss,
    Unavailable,
    DatabaseError,
}

impl FeedStatus {
    pub const ALL: [FeedStatus; 7] = [
        FeedStatus::Success,
        FeedStatus::NotModified,
        FeedStatus::Discontinued,
        FeedStatus::Duplicate,
        FeedStatus::InvalidRss,
        FeedStatus::Unavailable,
        FeedStatus::DatabaseError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::NotModified => "not_modified",
            Self::Discontinued => "discontinued",
            Self::Duplicate => "duplicate",
            Self::InvalidRss => "invalid_rss",
            Self::Unavailable => "unavailable",
            Self::DatabaseError => "database_error",
        }
    }
}

impl fmt::Display for FeedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DatabaseError::Corrupt(format!("unknown feed_status {:?}", s)))
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub(crate) fn to_timestamp(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

pub(crate) fn from_timestamp(ts: i64) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::from_timestamp(ts, 0)
        .ok_or_else(|| DatabaseError::Corrupt(format!("timestamp out of range: {}", ts)))
}

fn from_optional_timestamp(ts: Option<i64>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    ts.map(from_timestamp).transpose()
}

// ============================================================================
// Podcast
// ============================================================================

/// Internal row type for podcast queries
/// Converts to Podcast via into_podcast()
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct PodcastDbRow {
    pub id: i64,
    pub rss: String,
    pub active: bool,
    pub canonical: Option<i64>,
    pub etag: Option<String>,
    pub modified: Option<i64>,
    pub content_hash: Option<String>,
    pub frequency: Option<i64>,
    pub parsed: Option<i64>,
    pub pub_date: Option<i64>,
    pub num_retries: i64,
    pub feed_status: Option<String>,
    pub num_episodes: i64,
    pub exception: String,
    pub extracted_text: String,
    pub title: String,
    pub description: String,
    pub owner: String,
    pub website: Option<String>,
    pub cover_url: Option<String>,
    pub funding_url: Option<String>,
    pub funding_text: String,
    pub language: String,
    pub explicit: bool,
    pub podcast_type: String,
    pub keywords: String,
    pub subscribers: i64,
    pub promoted: bool,
    pub created: i64,
    pub updated: i64,
}

impl PodcastDbRow {
    pub(crate) fn into_podcast(self) -> Result<Podcast, DatabaseError> {
        Ok(Podcast {
            id: self.id,
            rss: self.rss,
            active: self.active,
            canonical: self.canonical,
            etag: self.etag,
            modified: from_optional_timestamp(self.modified)?,
            content_hash: self.content_hash,
            frequency: self
                .frequency
                .map(|secs| {
                    TimeDelta::try_seconds(secs).ok_or_else(|| {
                        DatabaseError::Corrupt(format!("frequency out of range: {}", secs))
                    })
                })
                .transpose()?,
            parsed: from_optional_timestamp(self.parsed)?,
            pub_date: from_optional_timestamp(self.pub_date)?,
            num_retries: u32::try_from(self.num_retries).unwrap_or(0),
            feed_status: self
                .feed_status
                .as_deref()
                .map(str::parse::<FeedStatus>)
                .transpose()?,
            num_episodes: self.num_episodes,
            exception: self.exception,
            extracted_text: self.extracted_text,
            title: self.title,
            description: self.description,
            owner: self.owner,
            website: self.website,
            cover_url: self.cover_url,
            funding_url: self.funding_url,
            funding_text: self.funding_text,
            language: self.language,
            explicit: self.explicit,
            podcast_type: PodcastType::from_feed_value(&self.podcast_type).unwrap_or_default(),
            keywords: self.keywords,
            subscribers: self.subscribers,
            promoted: self.promoted,
            created: from_timestamp(self.created)?,
            updated: from_timestamp(self.updated)?,
        })
    }
}

/// A podcast row as seen by the ingestion pipeline.
///
/// Loaded once at the start of a run; the orchestrator never re-reads it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Podcast {
    pub id: i64,
    /// Feed URL; unique across all podcasts.
    pub rss: String,
    pub active: bool,
    /// Surviving podcast when this row is a duplicate.
    pub canonical: Option<i64>,
    pub etag: Option<String>,
    pub modified: Option<DateTime<Utc>>,
    /// Hex SHA-256 of the last fetched (trimmed) body.
    pub content_hash: Option<String>,
    /// Poll interval; `None` until the first successful parse.
    pub frequency: Option<TimeDelta>,
    /// Last update attempt.
    pub parsed: Option<DateTime<Utc>>,
    pub pub_date: Option<DateTime<Utc>>,
    pub num_retries: u32,
    pub feed_status: Option<FeedStatus>,
    pub num_episodes: i64,
    pub exception: String,
    pub extracted_text: String,
    pub title: String,
    pub description: String,
    pub owner: String,
    pub website: Option<String>,
    pub cover_url: Option<String>,
    pub funding_url: Option<String>,
    pub funding_text: String,
    pub language: String,
    pub explicit: bool,
    pub podcast_type: PodcastType,
    pub keywords: String,
    pub subscribers: i64,
    pub promoted: bool,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// HTTP cache validators stored after a successful fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheValidators {
    pub etag: Option<String>,
    pub modified: Option<DateTime<Utc>>,
    pub content_hash: String,
}

/// The single terminal write of an update run.
///
/// `canonical`, `rss` and `validators` are only written when set.
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeUpdate {
    pub status: FeedStatus,
    pub active: bool,
    pub num_retries: u32,
    pub frequency: TimeDelta,
    pub parsed: DateTime<Utc>,
    pub exception: String,
    pub canonical: Option<i64>,
    pub rss: Option<String>,
    pub validators: Option<CacheValidators>,
}

impl OutcomeUpdate {
    pub fn new(status: FeedStatus, parsed: DateTime<Utc>, frequency: TimeDelta) -> Self {
        Self {
            status,
            active: true,
            num_retries: 0,
            frequency,
            parsed,
            exception: String::new(),
            canonical: None,
            rss: None,
            validators: None,
        }
    }
}

// ============================================================================
// Episode
// ============================================================================

/// Internal row type for episode queries
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EpisodeDbRow {
    pub id: i64,
    pub podcast_id: i64,
    pub guid: String,
    pub title: String,
    pub description: String,
    pub pub_date: i64,
    pub media_url: String,
    pub media_type: String,
    pub file_size: Option<i64>,
    pub duration: String,
    pub explicit: bool,
    pub season: Option<i64>,
    pub episode: Option<i64>,
    pub episode_type: String,
    pub website: Option<String>,
    pub cover_url: Option<String>,
    pub keywords: String,
}

impl EpisodeDbRow {
    pub(crate) fn into_episode(self) -> Result<Episode, DatabaseError> {
        Ok(Episode {
            id: self.id,
            podcast_id: self.podcast_id,
            guid: self.guid,
            title: self.title,
            description: self.description,
            pub_date: from_timestamp(self.pub_date)?,
            media_url: self.media_url,
            media_type: self.media_type,
            file_size: self.file_size,
            duration: self.duration,
            explicit: self.explicit,
            season: self.season.and_then(|s| i32::try_from(s).ok()),
            episode: self.episode.and_then(|e| i32::try_from(e).ok()),
            episode_type: EpisodeType::from_feed_value(&self.episode_type).unwrap_or_default(),
            website: self.website,
            cover_url: self.cover_url,
            keywords: self.keywords,
        })
    }
}

/// A stored episode
#[derive(Debug, Clone, PartialEq)]
pub struct Episode {
    pub id: i64,
    pub podcast_id: i64,
    pub guid: String,
    pub title: String,
    pub description: String,
    pub pub_date: DateTime<Utc>,
    pub media_url: String,
    pub media_type: String,
    pub file_size: Option<i64>,
    pub duration: String,
    pub explicit: bool,
    pub season: Option<i32>,
    pub episode: Option<i32>,
    pub episode_type: EpisodeType,
    pub website: Option<String>,
    pub cover_url: Option<String>,
    pub keywords: String,
}

/// Row counts from one episode upsert
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertStats {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
}

// ============================================================================
// Categories
// ============================================================================

/// Row from the `categories` lookup table
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub slug: String,
}

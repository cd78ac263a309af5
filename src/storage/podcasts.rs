use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use super::schema::Database;
use super::session::Session;
use super::types::{to_timestamp, DatabaseError, OutcomeUpdate, Podcast, PodcastDbRow};
use crate::feed::scheduler::DEFAULT_FREQUENCY;

/// Column list matching [`PodcastDbRow`].
const PODCAST_COLUMNS: &str = "id, rss, active, canonical, etag, modified, content_hash, \
     frequency, parsed, pub_date, num_retries, feed_status, num_episodes, exception, \
     extracted_text, title, description, owner, website, cover_url, funding_url, funding_text, \
     language, explicit, podcast_type, keywords, subscribers, promoted, created, updated";

impl Database {
    // ========================================================================
    // Podcast Operations
    // ========================================================================

    /// Register a podcast by feed URL, returning its ID.
    ///
    /// Idempotent: an already registered URL returns the existing ID.
    pub async fn add_podcast(&self, rss: &str) -> Result<i64, DatabaseError> {
        let now = to_timestamp(Utc::now());
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO podcasts (rss, created, updated) VALUES (?, ?, ?) ON CONFLICT(rss) DO NOTHING",
        )
        .bind(rss)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let (id,): (i64,) = sqlx::query_as("SELECT id FROM podcasts WHERE rss = ?")
            .bind(rss)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(id)
    }

    pub async fn get_podcast(&self, id: i64) -> Result<Option<Podcast>, DatabaseError> {
        let row: Option<PodcastDbRow> =
            sqlx::query_as(&format!("SELECT {} FROM podcasts WHERE id = ?", PODCAST_COLUMNS))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(PodcastDbRow::into_podcast).transpose()
    }

    /// Active podcasts whose next poll is due at `now`, most urgent first.
    ///
    /// Ordering: never-parsed podcasts (newest registrations first), then
    /// promoted, then most subscribed, then most overdue.
    pub async fn find_due(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Podcast>, DatabaseError> {
        let default_frequency = DEFAULT_FREQUENCY.num_seconds();
        let query = format!(
            r#"
            SELECT {columns} FROM podcasts
            WHERE active = 1
              AND (parsed IS NULL
                   OR MAX(parsed, COALESCE(pub_date, 0)) + COALESCE(frequency, ?) <= ?)
            ORDER BY
                parsed IS NOT NULL,
                CASE WHEN parsed IS NULL THEN created END DESC,
                promoted DESC,
                subscribers DESC,
                MAX(COALESCE(parsed, 0), COALESCE(pub_date, 0)) + COALESCE(frequency, ?) ASC,
                id
            LIMIT ?
        "#,
            columns = PODCAST_COLUMNS
        );

        let rows: Vec<PodcastDbRow> = sqlx::query_as(&query)
            .bind(default_frequency)
            .bind(to_timestamp(now))
            .bind(default_frequency)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(PodcastDbRow::into_podcast).collect()
    }

    /// Set the externally maintained audience fields used for batch ordering.
    pub async fn set_audience(
        &self,
        id: i64,
        subscribers: i64,
        promoted: bool,
    ) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE podcasts SET subscribers = ?, promoted = ? WHERE id = ?")
            .bind(subscribers)
            .bind(promoted)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

impl Session {
    /// ID of a podcast other than `exclude_id` registered under `rss`.
    pub async fn find_other_by_rss(
        &mut self,
        rss: &str,
        exclude_id: i64,
    ) -> Result<Option<i64>, DatabaseError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM podcasts WHERE rss = ? AND id != ?")
            .bind(rss)
            .bind(exclude_id)
            .fetch_optional(&mut *self.conn)
            .await?;
        Ok(row.map(|(id,)| id))
    }

    /// Oldest podcast other than `exclude_id` whose last body hashed to `hash`.
    pub async fn find_other_by_content_hash(
        &mut self,
        hash: &str,
        exclude_id: i64,
    ) -> Result<Option<i64>, DatabaseError> {
        if hash.is_empty() {
            return Ok(None);
        }
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM podcasts WHERE content_hash = ? AND id != ? ORDER BY id LIMIT 1",
        )
        .bind(hash)
        .bind(exclude_id)
        .fetch_optional(&mut *self.conn)
        .await?;
        Ok(row.map(|(id,)| id))
    }

    /// The `canonical` pointer of podcast `id`; `None` if unset or the row is gone.
    pub async fn canonical_of(&mut self, id: i64) -> Result<Option<i64>, DatabaseError> {
        let row: Option<(Option<i64>,)> =
            sqlx::query_as("SELECT canonical FROM podcasts WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *self.conn)
                .await?;
        Ok(row.and_then(|(canonical,)| canonical))
    }

    /// Persist the terminal state of an update run in one statement.
    pub async fn record_outcome(
        &mut self,
        podcast_id: i64,
        update: &OutcomeUpdate,
    ) -> Result<(), DatabaseError> {
        write_outcome(&mut *self.conn, podcast_id, update).await
    }
}

/// Single `UPDATE` of the run bookkeeping columns, keyed by podcast id.
pub(crate) async fn write_outcome(
    conn: &mut SqliteConnection,
    podcast_id: i64,
    update: &OutcomeUpdate,
) -> Result<(), DatabaseError> {
    let parsed = to_timestamp(update.parsed);

    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE podcasts SET feed_status = ");
    builder
        .push_bind(update.status.as_str())
        .push(", active = ")
        .push_bind(update.active)
        .push(", num_retries = ")
        .push_bind(i64::from(update.num_retries))
        .push(", frequency = ")
        .push_bind(update.frequency.num_seconds())
        .push(", parsed = ")
        .push_bind(parsed)
        .push(", updated = ")
        .push_bind(parsed)
        .push(", exception = ")
        .push_bind(update.exception.as_str());

    if let Some(canonical) = update.canonical {
        builder.push(", canonical = ").push_bind(canonical);
    }
    if let Some(rss) = &update.rss {
        builder.push(", rss = ").push_bind(rss.as_str());
    }
    if let Some(validators) = &update.validators {
        builder
            .push(", etag = ")
            .push_bind(validators.etag.as_deref())
            .push(", modified = ")
            .push_bind(validators.modified.map(to_timestamp))
            .push(", content_hash = ")
            .push_bind(validators.content_hash.as_str());
    }

    builder.push(" WHERE id = ").push_bind(podcast_id);

    let result = builder.build().execute(conn).await?;
    if result.rows_affected() == 0 {
        tracing::debug!(podcast_id, "Outcome for a podcast that no longer exists");
    }
    Ok(())
}

use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use std::collections::HashSet;

use super::podcasts::write_outcome;
use super::schema::Database;
use super::session::Session;
use super::types::{to_timestamp, DatabaseError, Episode, EpisodeDbRow, OutcomeUpdate, UpsertStats};
use crate::feed::{Feed, Item};

/// Rows per statement. 16 columns * 50 = 800 bound parameters, well under
/// SQLite's limit.
const BATCH_SIZE: usize = 50;

const EPISODE_INSERT: &str = "INSERT INTO episodes (podcast_id, guid, title, description, \
     pub_date, media_url, media_type, file_size, duration, explicit, season, episode, \
     episode_type, website, cover_url, keywords) ";

/// Keep the last occurrence of each guid, preserving feed order otherwise.
fn dedupe_by_guid(items: &[Item]) -> Vec<&Item> {
    let mut seen = HashSet::new();
    let mut unique: Vec<&Item> = items
        .iter()
        .rev()
        .filter(|item| seen.insert(item.guid.as_str()))
        .collect();
    unique.reverse();
    unique
}

fn push_episode_values<'a>(
    builder: &mut QueryBuilder<'a, Sqlite>,
    podcast_id: i64,
    chunk: &[&'a Item],
) {
    builder.push_values(chunk.iter().copied(), |mut b, item| {
        b.push_bind(podcast_id)
            .push_bind(&item.guid)
            .push_bind(&item.title)
            .push_bind(&item.description)
            .push_bind(to_timestamp(item.pub_date))
            .push_bind(&item.media_url)
            .push_bind(&item.media_type)
            .push_bind(item.file_size)
            .push_bind(&item.duration)
            .push_bind(item.explicit)
            .push_bind(item.season)
            .push_bind(item.episode)
            .push_bind(item.episode_type.as_str())
            .push_bind(&item.website)
            .push_bind(&item.cover_url)
            .push_bind(&item.keywords);
    });
}

/// Diff `items` against the stored episodes of `podcast_id` and apply the
/// difference inside the caller's transaction.
async fn upsert_episodes(
    conn: &mut SqliteConnection,
    podcast_id: i64,
    items: &[Item],
) -> Result<UpsertStats, DatabaseError> {
    let items = dedupe_by_guid(items);
    let mut stats = UpsertStats::default();

    let stored: Vec<(String,)> = sqlx::query_as("SELECT guid FROM episodes WHERE podcast_id = ?")
        .bind(podcast_id)
        .fetch_all(&mut *conn)
        .await?;
    let stored: HashSet<String> = stored.into_iter().map(|(guid,)| guid).collect();
    let incoming: HashSet<&str> = items.iter().map(|item| item.guid.as_str()).collect();

    // Episodes whose guid vanished from the feed
    let stale: Vec<&String> = stored
        .iter()
        .filter(|guid| !incoming.contains(guid.as_str()))
        .collect();
    for chunk in stale.chunks(BATCH_SIZE) {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("DELETE FROM episodes WHERE podcast_id = ");
        builder.push_bind(podcast_id).push(" AND guid IN (");
        let mut separated = builder.separated(", ");
        for guid in chunk {
            separated.push_bind(guid.as_str());
        }
        separated.push_unseparated(")");
        stats.deleted += builder.build().execute(&mut *conn).await?.rows_affected();
    }

    let (existing, new): (Vec<&Item>, Vec<&Item>) = items
        .into_iter()
        .partition(|item| stored.contains(&item.guid));

    // A concurrent run may have inserted the same guid; that insert wins.
    for chunk in new.chunks(BATCH_SIZE) {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(EPISODE_INSERT);
        push_episode_values(&mut builder, podcast_id, chunk);
        builder.push(" ON CONFLICT(podcast_id, guid) DO NOTHING");
        stats.inserted += builder.build().execute(&mut *conn).await?.rows_affected();
    }

    for chunk in existing.chunks(BATCH_SIZE) {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(EPISODE_INSERT);
        push_episode_values(&mut builder, podcast_id, chunk);
        builder.push(
            " ON CONFLICT(podcast_id, guid) DO UPDATE SET \
             title = excluded.title, description = excluded.description, \
             pub_date = excluded.pub_date, media_url = excluded.media_url, \
             media_type = excluded.media_type, file_size = excluded.file_size, \
             duration = excluded.duration, explicit = excluded.explicit, \
             season = excluded.season, episode = excluded.episode, \
             episode_type = excluded.episode_type, website = excluded.website, \
             cover_url = excluded.cover_url, keywords = excluded.keywords",
        );
        stats.updated += builder.build().execute(&mut *conn).await?.rows_affected();
    }

    Ok(stats)
}

async fn replace_categories(
    conn: &mut SqliteConnection,
    podcast_id: i64,
    category_ids: &[i64],
) -> Result<(), DatabaseError> {
    sqlx::query("DELETE FROM podcast_categories WHERE podcast_id = ?")
        .bind(podcast_id)
        .execute(&mut *conn)
        .await?;

    for chunk in category_ids.chunks(BATCH_SIZE) {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("INSERT OR IGNORE INTO podcast_categories (podcast_id, category_id) ");
        builder.push_values(chunk, |mut b, category_id| {
            b.push_bind(podcast_id).push_bind(*category_id);
        });
        builder.build().execute(&mut *conn).await?;
    }
    Ok(())
}

async fn update_podcast_fields(
    conn: &mut SqliteConnection,
    podcast_id: i64,
    feed: &Feed,
    extracted_text: &str,
) -> Result<(), DatabaseError> {
    sqlx::query(
        r#"
        UPDATE podcasts SET
            title = ?, description = ?, owner = ?, website = ?, cover_url = ?,
            funding_url = ?, funding_text = ?, language = ?, explicit = ?,
            podcast_type = ?, keywords = ?, pub_date = ?, extracted_text = ?,
            num_episodes = (SELECT COUNT(*) FROM episodes WHERE podcast_id = ?)
        WHERE id = ?
    "#,
    )
    .bind(&feed.title)
    .bind(&feed.description)
    .bind(&feed.owner)
    .bind(&feed.website)
    .bind(&feed.cover_url)
    .bind(&feed.funding_url)
    .bind(&feed.funding_text)
    .bind(&feed.language)
    .bind(feed.explicit)
    .bind(feed.podcast_type.as_str())
    .bind(&feed.keywords)
    .bind(feed.pub_date.map(to_timestamp))
    .bind(extracted_text)
    .bind(podcast_id)
    .bind(podcast_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

impl Session {
    /// Persist a successfully parsed feed as one atomic unit: episodes,
    /// category assignment, podcast fields and the run outcome.
    ///
    /// Nothing is written if any step fails.
    pub async fn apply_feed(
        &mut self,
        podcast_id: i64,
        feed: &Feed,
        extracted_text: &str,
        category_ids: &[i64],
        outcome: &OutcomeUpdate,
    ) -> Result<UpsertStats, DatabaseError> {
        // IMMEDIATE takes the write lock up front. A deferred transaction that
        // reads first can fail with SQLITE_BUSY when upgrading, without waiting
        // on busy_timeout.
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *self.conn)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        let conn: &mut SqliteConnection = &mut self.conn;
        let result = async {
            let stats = upsert_episodes(conn, podcast_id, &feed.items).await?;
            replace_categories(conn, podcast_id, category_ids).await?;
            update_podcast_fields(conn, podcast_id, feed, extracted_text).await?;
            write_outcome(conn, podcast_id, outcome).await?;
            Ok::<_, DatabaseError>(stats)
        }
        .await;

        match result {
            Ok(stats) => match sqlx::query("COMMIT").execute(&mut *self.conn).await {
                Ok(_) => Ok(stats),
                Err(e) => {
                    self.rollback().await;
                    Err(DatabaseError::from_sqlx(e))
                }
            },
            Err(e) => {
                self.rollback().await;
                Err(e)
            }
        }
    }

    /// Abandon any open transaction on this connection.
    ///
    /// Harmless when no transaction is active.
    pub async fn rollback(&mut self) {
        if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *self.conn).await {
            tracing::debug!(error = %e, "Rollback without an open transaction");
        }
    }
}

impl Database {
    // ========================================================================
    // Episode Queries
    // ========================================================================

    /// Episodes of a podcast, newest first
    pub async fn get_episodes(&self, podcast_id: i64) -> Result<Vec<Episode>, DatabaseError> {
        let rows: Vec<EpisodeDbRow> = sqlx::query_as(
            r#"
            SELECT id, podcast_id, guid, title, description, pub_date, media_url, media_type,
                   file_size, duration, explicit, season, episode, episode_type, website,
                   cover_url, keywords
            FROM episodes
            WHERE podcast_id = ?
            ORDER BY pub_date DESC, id
        "#,
        )
        .bind(podcast_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EpisodeDbRow::into_episode).collect()
    }
}

use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::categories::DEFAULT_CATEGORIES;
use super::types::DatabaseError;
use crate::util::slugify;

/// Pool size when the caller does not ask for more.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

// ============================================================================
// Database
// ============================================================================

#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open a database connection and run migrations
    ///
    /// `":memory:"` opens a private in-memory database shared by the pool.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::Busy` if the file stays locked past the busy timeout,
    /// `DatabaseError::Migration` if the schema cannot be created.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        Self::open_with_connections(path, DEFAULT_MAX_CONNECTIONS).await
    }

    /// Open with room for `max_connections` pooled connections.
    ///
    /// Every update worker holds one connection for its whole lifetime, so the
    /// pool must be at least as large as the worker count plus one for the driver.
    pub async fn open_with_connections(
        path: &str,
        max_connections: u32,
    ) -> Result<Self, DatabaseError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // SEC-010: Database files are private to the service account
        #[cfg(unix)]
        if path != ":memory:" {
            use std::os::unix::fs::OpenOptionsExt;
            let db_path = std::path::Path::new(path);
            if !db_path.exists() && db_path.parent().is_some_and(|p| p.exists()) {
                // If creation fails, SQLite will report the error at connect_with.
                let _file = std::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(0o600)
                    .open(db_path)
                    .ok();
            }
        }

        // busy_timeout=5000: concurrent workers wait up to 5 seconds for the
        // write lock before SQLite returns SQLITE_BUSY.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .foreign_keys(true)
            .pragma("busy_timeout", "5000");
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        let db = Self { pool };
        db.migrate().await.map_err(|e| match DatabaseError::from_sqlx(e) {
            DatabaseError::Other(e) => DatabaseError::Migration(e.to_string()),
            busy => busy,
        })?;
        Ok(db)
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// All statements use `IF NOT EXISTS` / `OR IGNORE`, so re-running on an
    /// existing database is a no-op.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS podcasts (
                id INTEGER PRIMARY KEY,
                rss TEXT UNIQUE NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                canonical INTEGER REFERENCES podcasts(id) ON DELETE SET NULL,
                etag TEXT,
                modified INTEGER,
                content_hash TEXT,
                frequency INTEGER,
                parsed INTEGER,
                pub_date INTEGER,
                num_retries INTEGER NOT NULL DEFAULT 0,
                feed_status TEXT,
                num_episodes INTEGER NOT NULL DEFAULT 0,
                exception TEXT NOT NULL DEFAULT '',
                extracted_text TEXT NOT NULL DEFAULT '',
                title TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                owner TEXT NOT NULL DEFAULT '',
                website TEXT,
                cover_url TEXT,
                funding_url TEXT,
                funding_text TEXT NOT NULL DEFAULT '',
                language TEXT NOT NULL DEFAULT 'en',
                explicit INTEGER NOT NULL DEFAULT 0,
                podcast_type TEXT NOT NULL DEFAULT 'episodic',
                keywords TEXT NOT NULL DEFAULT '',
                subscribers INTEGER NOT NULL DEFAULT 0,
                promoted INTEGER NOT NULL DEFAULT 0,
                created INTEGER NOT NULL,
                updated INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS episodes (
                id INTEGER PRIMARY KEY,
                podcast_id INTEGER NOT NULL REFERENCES podcasts(id) ON DELETE CASCADE,
                guid TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                pub_date INTEGER NOT NULL,
                media_url TEXT NOT NULL,
                media_type TEXT NOT NULL,
                file_size INTEGER,
                duration TEXT NOT NULL DEFAULT '',
                explicit INTEGER NOT NULL DEFAULT 0,
                season INTEGER,
                episode INTEGER,
                episode_type TEXT NOT NULL DEFAULT 'full',
                website TEXT,
                cover_url TEXT,
                keywords TEXT NOT NULL DEFAULT '',
                UNIQUE(podcast_id, guid)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS categories (
                id INTEGER PRIMARY KEY,
                name TEXT UNIQUE NOT NULL,
                slug TEXT UNIQUE NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS podcast_categories (
                podcast_id INTEGER NOT NULL REFERENCES podcasts(id) ON DELETE CASCADE,
                category_id INTEGER NOT NULL REFERENCES categories(id) ON DELETE CASCADE,
                PRIMARY KEY (podcast_id, category_id)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Covers the due-batch filter: active = 1 AND parsed ...
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_podcasts_due ON podcasts(active, parsed)")
            .execute(&mut *tx)
            .await?;
        // Content-hash duplicate lookup runs after every successful fetch
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_podcasts_content_hash ON podcasts(content_hash)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_episodes_podcast_published ON episodes(podcast_id, pub_date DESC)",
        )
        .execute(&mut *tx)
        .await?;

        for name in DEFAULT_CATEGORIES {
            sqlx::query("INSERT OR IGNORE INTO categories (name, slug) VALUES (?, ?)")
                .bind(*name)
                .bind(slugify(name))
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        Ok(())
    }
}

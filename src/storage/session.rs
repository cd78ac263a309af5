use sqlx::pool::PoolConnection;
use sqlx::Sqlite;

use super::schema::Database;
use super::types::DatabaseError;

/// A database connection owned by one update worker.
///
/// Acquired once when the worker starts and released when it exits, so a
/// batch of N podcasts costs one pool checkout per worker rather than one per
/// query. Every pipeline read and write goes through a session.
pub struct Session {
    pub(crate) conn: PoolConnection<Sqlite>,
}

impl Database {
    /// Check a connection out of the pool for the lifetime of the returned session.
    pub async fn session(&self) -> Result<Session, DatabaseError> {
        let conn = self.pool.acquire().await.map_err(DatabaseError::from_sqlx)?;
        Ok(Session { conn })
    }
}

//! SQLite store bootstrap and error taxonomy.

use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};

/// Store errors. The `*AlreadyExists` and `*NotFound` variants are part of
/// the API contract: handlers treat `*NotFound` as "already gone" under
/// concurrent teardown.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("channel already exists: {0}")]
    ChannelAlreadyExists(String),

    #[error("client already exists: {0}")]
    ClientAlreadyExists(String),

    #[error("connection already exists: {0}")]
    ConnectionAlreadyExists(String),

    #[error("push connection already exists for channel: {0}")]
    PushConnectionExists(String),

    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    #[error("client not found: {0}")]
    ClientNotFound(String),

    #[error("connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("query error: {0}")]
    Query(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(e: sqlx::Error) -> Self {
        Self::Query(e.to_string())
    }
}

impl DatabaseError {
    /// Whether this error means the referenced row is already gone, which
    /// teardown paths treat as success.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ChannelNotFound(_) | Self::ClientNotFound(_) | Self::ConnectionNotFound(_)
        )
    }
}

/// Handle on the in-memory store. Cloning shares the underlying pool.
#[derive(Clone)]
pub struct SignalDatabase {
    pool: Pool<Sqlite>,
}

impl SignalDatabase {
    /// Open a fresh in-memory store and run migrations.
    ///
    /// A single pooled connection keeps every handle on the same in-memory
    /// database and serializes writers.
    pub async fn open_in_memory() -> Result<Self, DatabaseError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| DatabaseError::Connection(e.to_string()))?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;

        Ok(())
    }

    pub(crate) fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

/// Current time as seconds since the Unix epoch.
#[allow(clippy::cast_possible_wrap)]
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

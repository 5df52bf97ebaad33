//! Channel queries.

use super::models::ChannelInfo;
use super::store::{unix_timestamp, DatabaseError, SignalDatabase};

impl SignalDatabase {
    /// Seed a channel, failing if it already exists. Used for the debug/test
    /// default channel at startup.
    pub async fn ensure_default_channel(
        &self,
        channel_id: &str,
        channel_key: &str,
    ) -> Result<ChannelInfo, DatabaseError> {
        let mut txn = self.pool().begin().await?;

        let existing = sqlx::query_as::<_, ChannelInfo>("SELECT * FROM channels WHERE id = ?")
            .bind(channel_id)
            .fetch_optional(&mut *txn)
            .await?;
        if existing.is_some() {
            return Err(DatabaseError::ChannelAlreadyExists(channel_id.to_string()));
        }

        sqlx::query("INSERT INTO channels (id, key, created_at) VALUES (?, ?, ?)")
            .bind(channel_id)
            .bind(channel_key)
            .bind(unix_timestamp())
            .execute(&mut *txn)
            .await?;

        txn.commit().await?;
        self.find_channel(channel_id).await
    }

    /// Get a channel, creating it with the supplied key when absent. Only
    /// reachable when channel auto-creation is enabled.
    pub async fn find_or_create_channel(
        &self,
        channel_id: &str,
        channel_key: &str,
    ) -> Result<ChannelInfo, DatabaseError> {
        let mut txn = self.pool().begin().await?;

        let existing = sqlx::query_as::<_, ChannelInfo>("SELECT * FROM channels WHERE id = ?")
            .bind(channel_id)
            .fetch_optional(&mut *txn)
            .await?;
        if let Some(channel) = existing {
            return Ok(channel);
        }

        sqlx::query("INSERT INTO channels (id, key, created_at) VALUES (?, ?, ?)")
            .bind(channel_id)
            .bind(channel_key)
            .bind(unix_timestamp())
            .execute(&mut *txn)
            .await?;

        txn.commit().await?;
        self.find_channel(channel_id).await
    }

    /// Get a channel by id.
    pub async fn find_channel(&self, channel_id: &str) -> Result<ChannelInfo, DatabaseError> {
        sqlx::query_as::<_, ChannelInfo>("SELECT * FROM channels WHERE id = ?")
            .bind(channel_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::ChannelNotFound(channel_id.to_string()))
    }

    /// All channels, oldest first.
    pub async fn find_all_channels(&self) -> Result<Vec<ChannelInfo>, DatabaseError> {
        let channels =
            sqlx::query_as::<_, ChannelInfo>("SELECT * FROM channels ORDER BY created_at, id")
                .fetch_all(self.pool())
                .await?;
        Ok(channels)
    }

    /// Delete a channel by id.
    pub async fn delete_channel(&self, channel_id: &str) -> Result<(), DatabaseError> {
        let result = sqlx::query("DELETE FROM channels WHERE id = ?")
            .bind(channel_id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::ChannelNotFound(channel_id.to_string()));
        }
        Ok(())
    }
}

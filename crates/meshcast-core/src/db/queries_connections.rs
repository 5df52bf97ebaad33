//! Connection queries.

use super::models::{ConnectionInfo, ConnectionKind, ConnectionStatus, MEDIA_SERVER_ID};
use super::store::{unix_timestamp, DatabaseError, SignalDatabase};

impl SignalDatabase {
    /// Create the channel's upstream connection. At most one push connection
    /// may exist per channel; the check and insert share one transaction so
    /// a concurrent second push fails.
    pub async fn create_push_connection(
        &self,
        channel_id: &str,
        client_id: &str,
        connection_id: &str,
    ) -> Result<ConnectionInfo, DatabaseError> {
        let mut txn = self.pool().begin().await?;

        let push = sqlx::query_as::<_, ConnectionInfo>(
            "SELECT * FROM connections WHERE channel_id = ? AND kind = ?",
        )
        .bind(channel_id)
        .bind(ConnectionKind::PushToServer)
        .fetch_optional(&mut *txn)
        .await?;
        if push.is_some() {
            return Err(DatabaseError::PushConnectionExists(channel_id.to_string()));
        }

        let existing = sqlx::query_as::<_, ConnectionInfo>("SELECT * FROM connections WHERE id = ?")
            .bind(connection_id)
            .fetch_optional(&mut *txn)
            .await?;
        if existing.is_some() {
            return Err(DatabaseError::ConnectionAlreadyExists(
                connection_id.to_string(),
            ));
        }

        sqlx::query(
            "INSERT INTO connections (id, channel_id, from_id, to_id, kind, status, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(connection_id)
        .bind(channel_id)
        .bind(client_id)
        .bind(MEDIA_SERVER_ID)
        .bind(ConnectionKind::PushToServer)
        .bind(ConnectionStatus::Initialized)
        .bind(unix_timestamp())
        .execute(&mut *txn)
        .await?;

        txn.commit().await?;
        self.find_connection(connection_id).await
    }

    /// Create a downstream connection from the media server to a viewer.
    pub async fn create_pull_connection(
        &self,
        channel_id: &str,
        client_id: &str,
        connection_id: &str,
    ) -> Result<ConnectionInfo, DatabaseError> {
        self.insert_connection(
            channel_id,
            MEDIA_SERVER_ID,
            client_id,
            connection_id,
            ConnectionKind::PullFromServer,
        )
        .await
    }

    /// Create a peer connection from a forwarder to a fetcher.
    pub async fn create_peer_connection(
        &self,
        channel_id: &str,
        from_id: &str,
        to_id: &str,
        connection_id: &str,
    ) -> Result<ConnectionInfo, DatabaseError> {
        self.insert_connection(
            channel_id,
            from_id,
            to_id,
            connection_id,
            ConnectionKind::PeerToPeer,
        )
        .await
    }

    /// Create a classification probe connection from a candidate to a
    /// fetcher.
    pub async fn create_classify_connection(
        &self,
        channel_id: &str,
        from_id: &str,
        to_id: &str,
        connection_id: &str,
    ) -> Result<ConnectionInfo, DatabaseError> {
        self.insert_connection(
            channel_id,
            from_id,
            to_id,
            connection_id,
            ConnectionKind::Classify,
        )
        .await
    }

    async fn insert_connection(
        &self,
        channel_id: &str,
        from_id: &str,
        to_id: &str,
        connection_id: &str,
        kind: ConnectionKind,
    ) -> Result<ConnectionInfo, DatabaseError> {
        let mut txn = self.pool().begin().await?;

        let existing = sqlx::query_as::<_, ConnectionInfo>("SELECT * FROM connections WHERE id = ?")
            .bind(connection_id)
            .fetch_optional(&mut *txn)
            .await?;
        if existing.is_some() {
            return Err(DatabaseError::ConnectionAlreadyExists(
                connection_id.to_string(),
            ));
        }

        sqlx::query(
            "INSERT INTO connections (id, channel_id, from_id, to_id, kind, status, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(connection_id)
        .bind(channel_id)
        .bind(from_id)
        .bind(to_id)
        .bind(kind)
        .bind(ConnectionStatus::Initialized)
        .bind(unix_timestamp())
        .execute(&mut *txn)
        .await?;

        txn.commit().await?;
        self.find_connection(connection_id).await
    }

    /// The channel's upstream (push) connection.
    pub async fn find_upstream(&self, channel_id: &str) -> Result<ConnectionInfo, DatabaseError> {
        sqlx::query_as::<_, ConnectionInfo>(
            "SELECT * FROM connections WHERE channel_id = ? AND kind = ?",
        )
        .bind(channel_id)
        .bind(ConnectionKind::PushToServer)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DatabaseError::ConnectionNotFound(channel_id.to_string()))
    }

    /// The viewer's downstream (pull) connection, if any.
    pub async fn find_downstream(
        &self,
        channel_id: &str,
        to_id: &str,
    ) -> Result<ConnectionInfo, DatabaseError> {
        sqlx::query_as::<_, ConnectionInfo>(
            "SELECT * FROM connections WHERE channel_id = ? AND to_id = ? AND kind = ?",
        )
        .bind(channel_id)
        .bind(to_id)
        .bind(ConnectionKind::PullFromServer)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DatabaseError::ConnectionNotFound(to_id.to_string()))
    }

    /// All peer connections originating from a client.
    pub async fn find_all_peer_by_from(
        &self,
        channel_id: &str,
        from_id: &str,
    ) -> Result<Vec<ConnectionInfo>, DatabaseError> {
        let connections = sqlx::query_as::<_, ConnectionInfo>(
            "SELECT * FROM connections WHERE channel_id = ? AND from_id = ? AND kind = ? \
             ORDER BY created_at, id",
        )
        .bind(channel_id)
        .bind(from_id)
        .bind(ConnectionKind::PeerToPeer)
        .fetch_all(self.pool())
        .await?;
        Ok(connections)
    }

    /// All peer connections terminating at a client.
    pub async fn find_all_peer_by_to(
        &self,
        channel_id: &str,
        to_id: &str,
    ) -> Result<Vec<ConnectionInfo>, DatabaseError> {
        let connections = sqlx::query_as::<_, ConnectionInfo>(
            "SELECT * FROM connections WHERE channel_id = ? AND to_id = ? AND kind = ? \
             ORDER BY created_at, id",
        )
        .bind(channel_id)
        .bind(to_id)
        .bind(ConnectionKind::PeerToPeer)
        .fetch_all(self.pool())
        .await?;
        Ok(connections)
    }

    /// Every connection terminating at a client, regardless of kind.
    pub async fn find_all_by_to(
        &self,
        channel_id: &str,
        to_id: &str,
    ) -> Result<Vec<ConnectionInfo>, DatabaseError> {
        let connections = sqlx::query_as::<_, ConnectionInfo>(
            "SELECT * FROM connections WHERE channel_id = ? AND to_id = ? ORDER BY created_at, id",
        )
        .bind(channel_id)
        .bind(to_id)
        .fetch_all(self.pool())
        .await?;
        Ok(connections)
    }

    /// Every connection belonging to a channel. Used when a departing
    /// publisher cascades the whole channel away.
    pub async fn find_all_by_channel(
        &self,
        channel_id: &str,
    ) -> Result<Vec<ConnectionInfo>, DatabaseError> {
        let connections = sqlx::query_as::<_, ConnectionInfo>(
            "SELECT * FROM connections WHERE channel_id = ? ORDER BY created_at, id",
        )
        .bind(channel_id)
        .fetch_all(self.pool())
        .await?;
        Ok(connections)
    }

    /// Get a connection by id.
    pub async fn find_connection(
        &self,
        connection_id: &str,
    ) -> Result<ConnectionInfo, DatabaseError> {
        sqlx::query_as::<_, ConnectionInfo>("SELECT * FROM connections WHERE id = ?")
            .bind(connection_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::ConnectionNotFound(connection_id.to_string()))
    }

    /// Advance a connection's status, stamping `connected_at` on the
    /// transition to Connected. Returns the updated row.
    pub async fn update_connection_status(
        &self,
        connection_id: &str,
        status: ConnectionStatus,
    ) -> Result<ConnectionInfo, DatabaseError> {
        let connected_at = match status {
            ConnectionStatus::Connected => Some(unix_timestamp()),
            ConnectionStatus::Initialized => None,
        };
        let result = sqlx::query("UPDATE connections SET status = ?, connected_at = ? WHERE id = ?")
            .bind(status)
            .bind(connected_at)
            .bind(connection_id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::ConnectionNotFound(connection_id.to_string()));
        }
        self.find_connection(connection_id).await
    }

    /// Delete a connection by id. Unknown ids return `ConnectionNotFound`,
    /// which teardown call sites treat as success.
    pub async fn delete_connection(&self, connection_id: &str) -> Result<(), DatabaseError> {
        let result = sqlx::query("DELETE FROM connections WHERE id = ?")
            .bind(connection_id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::ConnectionNotFound(connection_id.to_string()));
        }
        Ok(())
    }
}

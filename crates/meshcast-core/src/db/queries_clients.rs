//! Client queries.

use super::models::{ClientClass, ClientInfo};
use super::store::{unix_timestamp, DatabaseError, SignalDatabase};

impl SignalDatabase {
    /// Create a client in a channel. New clients start as candidates.
    pub async fn create_client(
        &self,
        channel_id: &str,
        client_id: &str,
    ) -> Result<ClientInfo, DatabaseError> {
        let mut txn = self.pool().begin().await?;

        let existing = sqlx::query_as::<_, ClientInfo>(
            "SELECT * FROM clients WHERE channel_id = ? AND id = ?",
        )
        .bind(channel_id)
        .bind(client_id)
        .fetch_optional(&mut *txn)
        .await?;
        if existing.is_some() {
            return Err(DatabaseError::ClientAlreadyExists(client_id.to_string()));
        }

        sqlx::query("INSERT INTO clients (channel_id, id, class, created_at) VALUES (?, ?, ?, ?)")
            .bind(channel_id)
            .bind(client_id)
            .bind(ClientClass::Candidate)
            .bind(unix_timestamp())
            .execute(&mut *txn)
            .await?;

        txn.commit().await?;
        self.find_client(channel_id, client_id).await
    }

    /// Get a client by (channel, id).
    pub async fn find_client(
        &self,
        channel_id: &str,
        client_id: &str,
    ) -> Result<ClientInfo, DatabaseError> {
        sqlx::query_as::<_, ClientInfo>("SELECT * FROM clients WHERE channel_id = ? AND id = ?")
            .bind(channel_id)
            .bind(client_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::ClientNotFound(client_id.to_string()))
    }

    /// All clients of a channel with the given class, oldest first.
    pub async fn find_clients_by_class(
        &self,
        channel_id: &str,
        class: ClientClass,
    ) -> Result<Vec<ClientInfo>, DatabaseError> {
        let clients = sqlx::query_as::<_, ClientInfo>(
            "SELECT * FROM clients WHERE channel_id = ? AND class = ? ORDER BY created_at, id",
        )
        .bind(channel_id)
        .bind(class)
        .fetch_all(self.pool())
        .await?;
        Ok(clients)
    }

    /// Reclassify a client.
    pub async fn update_client_class(
        &self,
        channel_id: &str,
        client_id: &str,
        class: ClientClass,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE clients SET class = ? WHERE channel_id = ? AND id = ?")
            .bind(class)
            .bind(channel_id)
            .bind(client_id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::ClientNotFound(client_id.to_string()));
        }
        Ok(())
    }

    /// Delete a client by (channel, id).
    pub async fn delete_client(
        &self,
        channel_id: &str,
        client_id: &str,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query("DELETE FROM clients WHERE channel_id = ? AND id = ?")
            .bind(channel_id)
            .bind(client_id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::ClientNotFound(client_id.to_string()));
        }
        Ok(())
    }
}

use sync_core::errors::ClientError;
use sync_core::protocol::Op;
use sync_core::SyncResult;
use uuid::Uuid;

use crate::database::ClientDatabase;

/// A pending local commit read back from `sync_outbox`, ready to flush.
#[derive(Debug, Clone)]
pub struct QueuedCommit {
    pub id: Uuid,
    pub client_commit_id: Uuid,
    pub operations: Vec<Op>,
    pub attempts: i32,
}

/// Thin wrapper over the `sync_outbox` table. The push loop drains it in
/// FIFO order; entries are removed only once the server has accepted the
/// commit they represent.
pub struct Outbox<'a> {
    db: &'a ClientDatabase,
}

impl<'a> Outbox<'a> {
    pub fn new(db: &'a ClientDatabase) -> Self {
        Self { db }
    }

    pub async fn enqueue(&self, client_commit_id: Uuid, operations: Vec<Op>) -> SyncResult<Uuid> {
        let id = Uuid::new_v4();
        let operations_json =
            serde_json::to_string(&operations).map_err(sync_core::SyncError::Serialization)?;
        sqlx::query(
            "INSERT INTO sync_outbox (id, client_commit_id, operations, created_at, attempts) VALUES (?, ?, ?, ?, 0)",
        )
        .bind(id.to_string())
        .bind(client_commit_id.to_string())
        .bind(operations_json)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(self.db.pool())
        .await
        .map_err(|e| ClientError::Database(e.to_string()))?;
        Ok(id)
    }

    /// Reads up to `limit` queued commits in FIFO (creation) order.
    pub async fn peek(&self, limit: i64) -> SyncResult<Vec<QueuedCommit>> {
        let rows = sqlx::query_as::<_, (String, String, String, i64)>(
            "SELECT id, client_commit_id, operations, attempts FROM sync_outbox ORDER BY created_at ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| ClientError::Database(e.to_string()))?;

        rows.into_iter()
            .map(|(id, client_commit_id, operations, attempts)| {
                let operations: Vec<Op> =
                    serde_json::from_str(&operations).map_err(sync_core::SyncError::Serialization)?;
                Ok(QueuedCommit {
                    id: Uuid::parse_str(&id).map_err(sync_core::SyncError::UuidParse)?,
                    client_commit_id: Uuid::parse_str(&client_commit_id)
                        .map_err(sync_core::SyncError::UuidParse)?,
                    operations,
                    attempts: attempts as i32,
                })
            })
            .collect()
    }

    pub async fn remove(&self, id: Uuid) -> SyncResult<()> {
        sqlx::query("DELETE FROM sync_outbox WHERE id = ?")
            .bind(id.to_string())
            .execute(self.db.pool())
            .await
            .map_err(|e| ClientError::Database(e.to_string()))?;
        Ok(())
    }

    pub async fn remove_by_client_commit_id(&self, client_commit_id: Uuid) -> SyncResult<()> {
        sqlx::query("DELETE FROM sync_outbox WHERE client_commit_id = ?")
            .bind(client_commit_id.to_string())
            .execute(self.db.pool())
            .await
            .map_err(|e| ClientError::Database(e.to_string()))?;
        Ok(())
    }

    pub async fn mark_retry(&self, id: Uuid, error: &str) -> SyncResult<()> {
        sqlx::query("UPDATE sync_outbox SET attempts = attempts + 1, last_error = ? WHERE id = ?")
            .bind(error)
            .bind(id.to_string())
            .execute(self.db.pool())
            .await
            .map_err(|e| ClientError::Database(e.to_string()))?;
        Ok(())
    }
}

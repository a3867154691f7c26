use crate::protocol::Change;
use crate::storage::Transaction;
use crate::SyncResult;
use async_trait::async_trait;
use uuid::Uuid;

/// Per-table sync behaviour, represented as a capability set rather than an
/// inheritance hierarchy. The engine holds one handler per table name and
/// dispatches to it during apply-pull; handlers receive a transaction
/// context per call and never hold a back-reference to the engine.
#[async_trait]
pub trait TableHandler: Send + Sync {
    /// Invoked once per subscription per fresh snapshot, before its first
    /// page is applied. Implementations that materialize into a dedicated
    /// local table typically clear stale rows for the subscription here.
    async fn on_snapshot_start(&self, tx: &mut dyn Transaction, subscription_id: Uuid) -> SyncResult<()>;

    /// Applies one page of snapshot rows within the caller's transaction.
    async fn apply_snapshot(
        &self,
        tx: &mut dyn Transaction,
        subscription_id: Uuid,
        rows: &[serde_json::Value],
    ) -> SyncResult<()>;

    /// Applies a single change: deletes remove by `row_id`, upserts merge
    /// the payload.
    async fn apply_change(&self, tx: &mut dyn Transaction, change: &Change) -> SyncResult<()>;

    /// Removes all locally materialized rows for this table, used when a
    /// subscription is torn down or a snapshot must be replaced wholesale.
    async fn clear_all(&self, tx: &mut dyn Transaction) -> SyncResult<()>;
}

/// Default handler that persists arbitrary JSON rows into a generic
/// `(table, row_id, row_json, row_version)` client table, for callers that
/// don't need bespoke materialization.
pub struct JsonRowHandler {
    table: String,
}

impl JsonRowHandler {
    pub fn new(table: impl Into<String>) -> Self {
        Self { table: table.into() }
    }
}

#[async_trait]
impl TableHandler for JsonRowHandler {
    async fn on_snapshot_start(&self, tx: &mut dyn Transaction, subscription_id: Uuid) -> SyncResult<()> {
        tx.query(
            "DELETE FROM sync_rows WHERE table_name = ? AND subscription_id = ?",
            &[serde_json::json!(self.table), serde_json::json!(subscription_id)],
        )
        .await?;
        Ok(())
    }

    async fn apply_snapshot(
        &self,
        tx: &mut dyn Transaction,
        subscription_id: Uuid,
        rows: &[serde_json::Value],
    ) -> SyncResult<()> {
        let batch: Vec<Vec<serde_json::Value>> = rows
            .iter()
            .filter_map(|row| {
                let row_id = row.get("id")?.clone();
                Some(vec![
                    serde_json::json!(self.table),
                    serde_json::json!(subscription_id),
                    row_id,
                    row.clone(),
                ])
            })
            .collect();

        tx.batch_insert(
            "sync_rows",
            &["table_name", "subscription_id", "row_id", "row_json"],
            batch,
            64,
        )
        .await
    }

    async fn apply_change(&self, tx: &mut dyn Transaction, change: &Change) -> SyncResult<()> {
        match change.op {
            crate::models::OpKind::Delete => {
                tx.query(
                    "DELETE FROM sync_rows WHERE table_name = ? AND row_id = ?",
                    &[serde_json::json!(self.table), serde_json::json!(change.row_id)],
                )
                .await?;
            }
            crate::models::OpKind::Upsert => {
                tx.query(
                    "INSERT OR REPLACE INTO sync_rows (table_name, row_id, row_json, row_version) VALUES (?, ?, ?, ?)",
                    &[
                        serde_json::json!(self.table),
                        serde_json::json!(change.row_id),
                        change.row_json.clone().unwrap_or(serde_json::Value::Null),
                        serde_json::json!(change.row_version),
                    ],
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn clear_all(&self, tx: &mut dyn Transaction) -> SyncResult<()> {
        tx.query("DELETE FROM sync_rows WHERE table_name = ?", &[serde_json::json!(self.table)])
            .await?;
        Ok(())
    }
}

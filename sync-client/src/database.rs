use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Column, Row as SqlxRow, SqlitePool};
use sync_core::errors::ClientError;
use sync_core::storage::{chunk_for_params, Row, Storage, Transaction};
use sync_core::SyncResult;

/// SQLite-backed client storage. The client holds a single pool entry point
/// guarded by a `tokio::sync::Mutex` so multi-statement transactions never
/// interleave with the sync engine's own queries on the same connection.
pub struct ClientDatabase {
    pool: SqlitePool,
}

impl ClientDatabase {
    pub async fn new(database_url: &str) -> SyncResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await
            .map_err(|e| ClientError::Database(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Idempotent schema bootstrap for the client-side bookkeeping tables
    /// plus the generic row-materialization table the default table handler
    /// writes into.
    pub async fn init_schema(&self) -> SyncResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| ClientError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_outbox (
                id TEXT PRIMARY KEY,
                client_commit_id TEXT NOT NULL UNIQUE,
                operations TEXT NOT NULL,
                created_at TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| ClientError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_client_cursors (
                partition_id TEXT PRIMARY KEY,
                cursor INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| ClientError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_subscription_state (
                subscription_id TEXT PRIMARY KEY,
                table_name TEXT NOT NULL,
                bootstrap_state TEXT NOT NULL,
                cursor INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| ClientError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_rows (
                table_name TEXT NOT NULL,
                row_id TEXT NOT NULL,
                subscription_id TEXT,
                row_json TEXT NOT NULL,
                row_version INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (table_name, row_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| ClientError::Database(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl Storage for ClientDatabase {
    async fn query(&self, statement: &str, params: &[serde_json::Value]) -> SyncResult<Vec<Row>> {
        run_query(&self.pool, statement, params).await
    }

    async fn transact<'a>(&'a self) -> SyncResult<Box<dyn Transaction + 'a>> {
        let tx = self.pool.begin().await.map_err(|e| ClientError::Database(e.to_string()))?;
        Ok(Box::new(SqliteTransaction { tx: Some(tx) }))
    }

    fn max_params(&self) -> usize {
        // SQLite's default SQLITE_MAX_VARIABLE_NUMBER on most builds.
        999
    }
}

struct SqliteTransaction {
    tx: Option<sqlx::Transaction<'static, sqlx::Sqlite>>,
}

#[async_trait]
impl Transaction for SqliteTransaction {
    async fn query(&mut self, statement: &str, params: &[serde_json::Value]) -> SyncResult<Vec<Row>> {
        let tx = self.tx.as_mut().ok_or_else(|| ClientError::InvalidState("transaction already closed".into()))?;
        let mut query = sqlx::query(statement);
        for param in params {
            query = bind_value(query, param);
        }
        let rows = query.fetch_all(&mut **tx).await.map_err(|e| ClientError::Database(e.to_string()))?;
        Ok(rows.iter().map(row_to_map).collect())
    }

    async fn batch_insert(
        &mut self,
        table: &str,
        columns: &[&str],
        rows: Vec<Vec<serde_json::Value>>,
        max_params: usize,
    ) -> SyncResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let tx = self.tx.as_mut().ok_or_else(|| ClientError::InvalidState("transaction already closed".into()))?;
        let placeholders: Vec<&str> = columns.iter().map(|_| "?").collect();
        let statement = format!(
            "INSERT OR REPLACE INTO {table} ({}) VALUES ({})",
            columns.join(", "),
            placeholders.join(", ")
        );
        for chunk in chunk_for_params(rows, columns.len(), max_params) {
            for row in chunk {
                let mut query = sqlx::query(&statement);
                for value in &row {
                    query = bind_value(query, value);
                }
                query.execute(&mut **tx).await.map_err(|e| ClientError::Database(e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> SyncResult<()> {
        let tx = self.tx.take().ok_or_else(|| ClientError::InvalidState("transaction already closed".into()))?;
        tx.commit().await.map_err(|e| ClientError::Database(e.to_string()))?;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> SyncResult<()> {
        let tx = self.tx.take().ok_or_else(|| ClientError::InvalidState("transaction already closed".into()))?;
        tx.rollback().await.map_err(|e| ClientError::Database(e.to_string()))?;
        Ok(())
    }
}

async fn run_query(pool: &SqlitePool, statement: &str, params: &[serde_json::Value]) -> SyncResult<Vec<Row>> {
    let mut query = sqlx::query(statement);
    for param in params {
        query = bind_value(query, param);
    }
    let rows = query.fetch_all(pool).await.map_err(|e| ClientError::Database(e.to_string()))?;
    Ok(rows.iter().map(row_to_map).collect())
}

fn bind_value<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    value: &'q serde_json::Value,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    match value {
        serde_json::Value::Null => query.bind(None::<String>),
        serde_json::Value::Bool(b) => query.bind(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.as_f64())
            }
        }
        serde_json::Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

fn row_to_map(row: &sqlx::sqlite::SqliteRow) -> Row {
    let mut map = Row::new();
    for column in row.columns() {
        let name = column.name().to_string();
        let value: serde_json::Value = row
            .try_get::<Option<String>, _>(name.as_str())
            .map(|v| v.map(serde_json::Value::String).unwrap_or(serde_json::Value::Null))
            .or_else(|_| row.try_get::<i64, _>(name.as_str()).map(|v| serde_json::json!(v)))
            .or_else(|_| row.try_get::<f64, _>(name.as_str()).map(|v| serde_json::json!(v)))
            .unwrap_or(serde_json::Value::Null);
        map.insert(name, value);
    }
    map
}

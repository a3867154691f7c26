use crate::SyncResult;
use async_trait::async_trait;

/// A row read back from storage: a column name -> JSON value map, dialect
/// agnostic so the core never depends on `sqlx::PgRow`/`SqliteRow` directly.
pub type Row = std::collections::HashMap<String, serde_json::Value>;

/// Thin façade over a SQL executor. Concrete dialects (Postgres on the
/// server, SQLite on the client) implement this so the push/pull pipelines
/// and the client sync engine never see the underlying driver.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Runs a parameterised query and returns the matching rows.
    async fn query(&self, statement: &str, params: &[serde_json::Value]) -> SyncResult<Vec<Row>>;

    /// Opens a multi-statement transaction. Dropping it without `commit`
    /// rolls back.
    async fn transact<'a>(&'a self) -> SyncResult<Box<dyn Transaction + 'a>>;

    /// Maximum number of bound parameters a single statement may carry for
    /// this dialect; callers split batched inserts to respect it.
    fn max_params(&self) -> usize;
}

/// A transaction scope: acquire, apply all statements, commit or roll back.
/// No partial apply is ever persisted — dropping without `commit` rolls
/// back implicitly at the driver level.
#[async_trait]
pub trait Transaction: Send {
    async fn query(&mut self, statement: &str, params: &[serde_json::Value]) -> SyncResult<Vec<Row>>;

    /// Inserts `rows` into `table`, splitting into multiple statements so
    /// that no single statement exceeds the dialect's parameter limit.
    async fn batch_insert(
        &mut self,
        table: &str,
        columns: &[&str],
        rows: Vec<Vec<serde_json::Value>>,
        max_params: usize,
    ) -> SyncResult<()>;

    async fn commit(self: Box<Self>) -> SyncResult<()>;

    async fn rollback(self: Box<Self>) -> SyncResult<()>;
}

/// Splits a row batch into chunks whose total bound-parameter count stays
/// within `max_params`, given the per-row column count.
pub fn chunk_for_params<T: Clone>(rows: Vec<T>, column_count: usize, max_params: usize) -> Vec<Vec<T>> {
    if column_count == 0 || max_params == 0 {
        return vec![rows];
    }
    let rows_per_chunk = (max_params / column_count).max(1);
    rows.chunks(rows_per_chunk)
        .map(|chunk| chunk.to_vec())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_respects_param_limit() {
        let rows: Vec<i32> = (0..10).collect();
        let chunks = chunk_for_params(rows, 3, 7);
        assert_eq!(chunks.iter().map(|c| c.len()).collect::<Vec<_>>(), vec![2, 2, 2, 2, 2]);
    }

    #[test]
    fn chunking_never_produces_empty_chunk_for_zero_rows() {
        let rows: Vec<i32> = Vec::new();
        let chunks = chunk_for_params(rows, 3, 7);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_empty());
    }

    #[test]
    fn single_chunk_when_limit_exceeds_batch() {
        let rows: Vec<i32> = (0..4).collect();
        let chunks = chunk_for_params(rows, 2, 100);
        assert_eq!(chunks.len(), 1);
    }
}

use chrono::Utc;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use sync_core::errors::SyncError;
use sync_core::models::OpKind;
use sync_core::protocol::{Change, Conflict, Op, Snap, Sub, SubState};
use sync_core::SyncResult;
use tracing::instrument;
use uuid::Uuid;

/// Server-side storage: a Postgres pool plus the idempotent DDL and the
/// push/pull pipeline operations that drive the commit log.
pub struct ServerDatabase {
    pub pool: PgPool,
}

impl ServerDatabase {
    #[instrument(skip(database_url))]
    pub async fn new(database_url: &str) -> SyncResult<Self> {
        let max_connections = if std::env::var("RUN_INTEGRATION_TESTS").is_ok() { 3 } else { 10 };

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .max_lifetime(std::time::Duration::from_secs(30))
            .idle_timeout(std::time::Duration::from_secs(10))
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Idempotently creates/upgrades the server tables. No external
    /// migration-file runner is required for this scope.
    #[instrument(skip(self))]
    pub async fn init_schema(&self) -> SyncResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_commits (
                commit_seq BIGSERIAL PRIMARY KEY,
                partition_id TEXT NOT NULL,
                client_id UUID NOT NULL,
                client_commit_id UUID NOT NULL,
                actor_id TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (client_id, client_commit_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sync_commits_partition_seq ON sync_commits (partition_id, commit_seq)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_changes (
                commit_seq BIGINT NOT NULL REFERENCES sync_commits (commit_seq),
                seq_in_commit INT NOT NULL,
                partition_id TEXT NOT NULL,
                table_name TEXT NOT NULL,
                row_id TEXT NOT NULL,
                op TEXT NOT NULL,
                row_json JSONB,
                row_version BIGINT NOT NULL,
                scope_keys TEXT[] NOT NULL,
                PRIMARY KEY (commit_seq, seq_in_commit)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sync_changes_partition_seq ON sync_changes (partition_id, commit_seq)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_row_versions (
                partition_id TEXT NOT NULL,
                table_name TEXT NOT NULL,
                row_id TEXT NOT NULL,
                row_version BIGINT NOT NULL,
                tombstoned BOOLEAN NOT NULL DEFAULT FALSE,
                PRIMARY KEY (partition_id, table_name, row_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_client_cursors (
                partition_id TEXT NOT NULL,
                client_id UUID NOT NULL,
                actor_id TEXT,
                cursor BIGINT NOT NULL DEFAULT 0,
                scopes TEXT[] NOT NULL DEFAULT '{}',
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                connection_mode TEXT NOT NULL DEFAULT 'http',
                activity_state TEXT NOT NULL DEFAULT 'active',
                PRIMARY KEY (partition_id, client_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_api_credentials (
                client_id UUID PRIMARY KEY,
                secret TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_blob_uploads (
                id UUID PRIMARY KEY,
                hash TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                expires_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sync_blob_uploads_status ON sync_blob_uploads (status)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sync_blob_uploads_expires_at ON sync_blob_uploads (expires_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_blobs (
                hash TEXT PRIMARY KEY,
                size_bytes BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Implements §4.2: validate, detect conflicts, allocate a commit_seq,
    /// write changes + row versions atomically. Returns the original
    /// commit_seq on an idempotent replay of an already-accepted commit.
    #[instrument(skip(self, operations, resolve_scopes))]
    pub async fn push(
        &self,
        partition_id: &str,
        client_id: Uuid,
        client_commit_id: Uuid,
        actor_id: Option<&str>,
        operations: &[Op],
        resolve_scopes: impl Fn(&str, &str, Option<&Value>) -> Vec<String>,
    ) -> SyncResult<(i64, Vec<Conflict>)> {
        let mut seen_rows = std::collections::HashSet::new();
        for op in operations {
            if !seen_rows.insert((op.table.clone(), op.row_id.clone())) {
                return Err(SyncError::DuplicateRowInCommit {
                    table: op.table.clone(),
                    row_id: op.row_id.clone(),
                });
            }
        }

        let mut tx = self.pool.begin().await?;

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT commit_seq FROM sync_commits WHERE client_id = $1 AND client_commit_id = $2",
        )
        .bind(client_id)
        .bind(client_commit_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(commit_seq) = existing {
            tx.rollback().await?;
            return Ok((commit_seq, Vec::new()));
        }

        let mut conflicts = Vec::new();
        let mut current_versions = Vec::with_capacity(operations.len());

        for op in operations {
            // CRITICAL: lock the row for the life of this transaction so a
            // concurrent push targeting the same row can't read the same
            // current_version and silently clobber this one (lost update).
            let row: Option<(i64, bool)> = sqlx::query_as(
                "SELECT row_version, tombstoned FROM sync_row_versions WHERE partition_id = $1 AND table_name = $2 AND row_id = $3 FOR UPDATE",
            )
            .bind(partition_id)
            .bind(&op.table)
            .bind(&op.row_id)
            .fetch_optional(&mut *tx)
            .await?;

            let (current_version, tombstoned) = row.unwrap_or((0, false));

            if let Some(base_version) = op.base_version {
                if base_version != current_version {
                    conflicts.push(Conflict {
                        row_id: op.row_id.clone(),
                        expected_base_version: op.base_version,
                        actual_row_version: current_version,
                    });
                }
            } else if op.op == OpKind::Delete && tombstoned {
                // Idempotent no-op: still allocates a commit below so all
                // subscribers observe a consistent ordering.
            }

            current_versions.push(current_version);
        }

        if !conflicts.is_empty() {
            tx.rollback().await?;
            return Ok((0, conflicts));
        }

        let commit_seq: i64 = sqlx::query_scalar(
            "INSERT INTO sync_commits (partition_id, client_id, client_commit_id, actor_id) VALUES ($1, $2, $3, $4) RETURNING commit_seq",
        )
        .bind(partition_id)
        .bind(client_id)
        .bind(client_commit_id)
        .bind(actor_id)
        .fetch_one(&mut *tx)
        .await?;

        for (seq_in_commit, (op, current_version)) in operations.iter().zip(current_versions).enumerate() {
            let new_version = current_version + 1;
            let tombstoned = op.op == OpKind::Delete;
            let scope_keys = resolve_scopes(&op.table, &op.row_id, op.payload.as_ref());

            sqlx::query(
                r#"
                INSERT INTO sync_row_versions (partition_id, table_name, row_id, row_version, tombstoned)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (partition_id, table_name, row_id)
                DO UPDATE SET row_version = $4, tombstoned = $5
                "#,
            )
            .bind(partition_id)
            .bind(&op.table)
            .bind(&op.row_id)
            .bind(new_version)
            .bind(tombstoned)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO sync_changes
                    (commit_seq, seq_in_commit, partition_id, table_name, row_id, op, row_json, row_version, scope_keys)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(commit_seq)
            .bind(seq_in_commit as i32)
            .bind(partition_id)
            .bind(&op.table)
            .bind(&op.row_id)
            .bind(op.op.to_string())
            .bind(&op.payload)
            .bind(new_version)
            .bind(&scope_keys)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok((commit_seq, Vec::new()))
    }

    /// Implements §4.3: for each subscription, either page a snapshot
    /// pinned to the commit it began at or stream the commit tail, bounded
    /// by the caller's limits. `max_snapshot_pages` caps how many snapshot
    /// pages this one response may carry in total across all subscriptions;
    /// subscriptions left over once the cap is hit keep their prior
    /// bootstrap state untouched and are retried on the next pull.
    /// `dedupe_rows`, when set, drops a row from a later subscription's
    /// snapshot page if an earlier subscription in the same response
    /// already carried that `(table, row_id)`.
    #[instrument(skip(self, subscriptions))]
    pub async fn pull(
        &self,
        partition_id: &str,
        subscriptions: &[Sub],
        limit_commits: u32,
        limit_snapshot_rows: u32,
        max_snapshot_pages: Option<u32>,
        dedupe_rows: Option<bool>,
    ) -> SyncResult<(Vec<Snap>, Vec<Change>, Vec<SubState>, bool)> {
        let head: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(commit_seq), 0) FROM sync_commits WHERE partition_id = $1",
        )
        .bind(partition_id)
        .fetch_one(&self.pool)
        .await?;

        let max_pages = max_snapshot_pages.unwrap_or(u32::MAX);
        let dedupe = dedupe_rows.unwrap_or(false);
        let mut pages_emitted: u32 = 0;
        let mut rows_seen: std::collections::HashSet<(String, String)> = std::collections::HashSet::new();

        let mut snaps = Vec::new();
        let mut changes = Vec::new();
        let mut states = Vec::new();
        let mut more = false;

        for sub in subscriptions {
            match sub.bootstrap_state {
                None | Some(sync_core::models::BootstrapState::PendingSnapshot) => {
                    if pages_emitted >= max_pages {
                        more = true;
                        continue;
                    }
                    // A fresh snapshot anchors to the current head and every
                    // later page of it must keep reading as of that commit,
                    // not a head that may have advanced by the next call.
                    let anchor = head;
                    let raw_rows = self.snapshot_page(partition_id, sub, 0, limit_snapshot_rows, anchor).await?;
                    let is_last_page = (raw_rows.len() as u32) < limit_snapshot_rows;
                    if !is_last_page {
                        more = true;
                    }
                    pages_emitted += 1;
                    let rows = dedupe_snapshot_rows(dedupe, &mut rows_seen, &sub.table, raw_rows);
                    snaps.push(Snap {
                        table: sub.table.clone(),
                        rows,
                        is_first_page: true,
                        is_last_page,
                        subscription_id: sub.id,
                        anchor_commit_seq: anchor,
                    });
                    states.push(SubState {
                        id: sub.id,
                        bootstrap_state: Some(if is_last_page {
                            sync_core::models::BootstrapState::CaughtUp { cursor: anchor }
                        } else {
                            sync_core::models::BootstrapState::SnapshotInProgress { page: 1, anchor_commit_seq: anchor }
                        }),
                    });
                }
                Some(sync_core::models::BootstrapState::SnapshotInProgress { page, anchor_commit_seq }) => {
                    if pages_emitted >= max_pages {
                        more = true;
                        continue;
                    }
                    let raw_rows =
                        self.snapshot_page(partition_id, sub, page, limit_snapshot_rows, anchor_commit_seq).await?;
                    let is_last_page = (raw_rows.len() as u32) < limit_snapshot_rows;
                    if !is_last_page {
                        more = true;
                    }
                    pages_emitted += 1;
                    let rows = dedupe_snapshot_rows(dedupe, &mut rows_seen, &sub.table, raw_rows);
                    snaps.push(Snap {
                        table: sub.table.clone(),
                        rows,
                        is_first_page: false,
                        is_last_page,
                        subscription_id: sub.id,
                        anchor_commit_seq,
                    });
                    states.push(SubState {
                        id: sub.id,
                        bootstrap_state: Some(if is_last_page {
                            sync_core::models::BootstrapState::CaughtUp { cursor: anchor_commit_seq }
                        } else {
                            sync_core::models::BootstrapState::SnapshotInProgress {
                                page: page + 1,
                                anchor_commit_seq,
                            }
                        }),
                    });
                }
                Some(sync_core::models::BootstrapState::CaughtUp { cursor }) => {
                    let rows: Vec<(i64, i32, String, String, String, Option<Value>, i64, Vec<String>)> =
                        sqlx::query_as(
                            r#"
                            SELECT c.commit_seq, c.seq_in_commit, c.table_name, c.row_id, c.op, c.row_json, c.row_version, c.scope_keys
                            FROM sync_changes c
                            WHERE c.partition_id = $1
                              AND c.commit_seq > $2
                              AND c.commit_seq <= $3
                              AND c.table_name = $4
                              AND c.scope_keys && $5
                            ORDER BY c.commit_seq, c.seq_in_commit
                            LIMIT $6
                            "#,
                        )
                        .bind(partition_id)
                        .bind(cursor)
                        .bind(head)
                        .bind(&sub.table)
                        .bind(&sub.scopes)
                        .bind(limit_commits as i64)
                        .fetch_all(&self.pool)
                        .await?;

                    let reached_limit = rows.len() as u32 >= limit_commits;
                    if reached_limit {
                        more = true;
                    }

                    let new_cursor = rows.last().map(|r| r.0).unwrap_or(cursor).max(cursor);
                    let effective_cursor = if reached_limit { new_cursor } else { head };

                    for (commit_seq, seq_in_commit, table, row_id, op, row_json, row_version, scope_keys) in rows {
                        changes.push(Change {
                            commit_seq,
                            seq_in_commit,
                            table,
                            row_id,
                            op: op.parse().unwrap_or(OpKind::Upsert),
                            row_json,
                            row_version,
                            scope_keys,
                        });
                    }

                    states.push(SubState {
                        id: sub.id,
                        bootstrap_state: Some(sync_core::models::BootstrapState::CaughtUp {
                            cursor: effective_cursor,
                        }),
                    });
                }
            }
        }

        Ok((snaps, changes, states, more))
    }

    /// Rows whose latest commit is at or before `anchor_commit_seq`, so
    /// every page of the same snapshot reads a single consistent point in
    /// time regardless of commits landing between pages.
    async fn snapshot_page(
        &self,
        partition_id: &str,
        sub: &Sub,
        page: u32,
        page_size: u32,
        anchor_commit_seq: i64,
    ) -> SyncResult<Vec<(String, Value)>> {
        let rows: Vec<(String, Value)> = sqlx::query_as(
            r#"
            SELECT c.row_id, c.row_json
            FROM sync_changes c
            INNER JOIN (
                SELECT table_name, row_id, MAX(commit_seq) AS commit_seq
                FROM sync_changes
                WHERE partition_id = $1 AND table_name = $2 AND scope_keys && $3 AND commit_seq <= $4
                GROUP BY table_name, row_id
            ) latest ON latest.table_name = c.table_name AND latest.row_id = c.row_id AND latest.commit_seq = c.commit_seq
            WHERE c.op = 'upsert'
            ORDER BY c.table_name, c.row_id
            OFFSET $5 LIMIT $6
            "#,
        )
        .bind(partition_id)
        .bind(&sub.table)
        .bind(&sub.scopes)
        .bind(anchor_commit_seq)
        .bind((page * page_size) as i64)
        .bind(page_size as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    #[instrument(skip(self))]
    pub async fn upsert_cursor(
        &self,
        partition_id: &str,
        client_id: Uuid,
        cursor: i64,
        scopes: &[String],
    ) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_client_cursors (partition_id, client_id, cursor, scopes, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (partition_id, client_id)
            DO UPDATE SET cursor = GREATEST(sync_client_cursors.cursor, $3), scopes = $4, updated_at = $5
            "#,
        )
        .bind(partition_id)
        .bind(client_id)
        .bind(cursor)
        .bind(scopes)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Drops a row already seen under `(table, row_id)` earlier in the same
/// pull response, when cross-subscription dedup is requested. Leaves order
/// and content untouched when it isn't.
fn dedupe_snapshot_rows(
    dedupe: bool,
    seen: &mut std::collections::HashSet<(String, String)>,
    table: &str,
    rows: Vec<(String, Value)>,
) -> Vec<Value> {
    rows.into_iter()
        .filter(|(row_id, _)| !dedupe || seen.insert((table.to_string(), row_id.clone())))
        .map(|(_, row_json)| row_json)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::protocol::Op;

    async fn test_db() -> Option<ServerDatabase> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let db = ServerDatabase::new(&url).await.ok()?;
        db.init_schema().await.ok()?;
        Some(db)
    }

    #[tokio::test]
    async fn push_is_idempotent_on_replay() {
        let Some(db) = test_db().await else {
            println!("skipping: TEST_DATABASE_URL not set");
            return;
        };

        let client_id = Uuid::new_v4();
        let client_commit_id = Uuid::new_v4();
        let ops = vec![Op {
            table: "widgets".to_string(),
            row_id: "w1".to_string(),
            op: OpKind::Upsert,
            payload: Some(serde_json::json!({"id": "w1", "name": "thing"})),
            base_version: None,
        }];

        let (seq1, conflicts1) = db
            .push("default", client_id, client_commit_id, None, &ops, |_, _, _| vec!["global".to_string()])
            .await
            .unwrap();
        assert!(conflicts1.is_empty());

        let (seq2, conflicts2) = db
            .push("default", client_id, client_commit_id, None, &ops, |_, _, _| vec!["global".to_string()])
            .await
            .unwrap();
        assert_eq!(seq1, seq2);
        assert!(conflicts2.is_empty());
    }

    #[tokio::test]
    async fn duplicate_row_in_commit_rejected() {
        let Some(db) = test_db().await else {
            println!("skipping: TEST_DATABASE_URL not set");
            return;
        };

        let ops = vec![
            Op {
                table: "widgets".to_string(),
                row_id: "dup".to_string(),
                op: OpKind::Upsert,
                payload: Some(serde_json::json!({"id": "dup"})),
                base_version: None,
            },
            Op {
                table: "widgets".to_string(),
                row_id: "dup".to_string(),
                op: OpKind::Delete,
                payload: None,
                base_version: None,
            },
        ];

        let result = db
            .push("default", Uuid::new_v4(), Uuid::new_v4(), None, &ops, |_, _, _| vec![])
            .await;
        assert!(matches!(result, Err(SyncError::DuplicateRowInCommit { .. })));
    }
}

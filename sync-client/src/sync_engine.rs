use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use sync_core::models::{BootstrapState, MutationTimestamps, OpKind};
use sync_core::protocol::{
    Change as WireChange, Op, PullRequest, PushRequest, Request, Sub, CURRENT_SCHEMA_VERSION,
};
use sync_core::storage::Storage;
use sync_core::SyncResult;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::database::ClientDatabase;
use crate::handlers::HandlerRegistry;
use crate::outbox::Outbox;
use crate::transport::Transport;

/// A conflict surfaced from a rejected push, joined back to the table it
/// targeted so the caller doesn't have to cross-reference the outbox.
#[derive(Debug, Clone)]
pub struct ConflictReport {
    pub table: String,
    pub row_id: String,
    pub expected_base_version: Option<i64>,
    pub actual_row_version: i64,
    /// Identifies the still-queued outbox entry that produced this
    /// conflict, so a caller can discard it via `resolve_conflict` once a
    /// corrected mutation has been applied.
    pub client_commit_id: Uuid,
}

struct SubscriptionHandle {
    id: Uuid,
    table: String,
    scopes: Vec<String>,
    params: std::collections::HashMap<String, String>,
    bootstrap_state: Option<BootstrapState>,
    cursor: i64,
}

/// Drives the outbox flush loop, the pull/apply loop, mutation-timestamp
/// tracking, and fingerprint-friendly bookkeeping for one local database.
/// Single-threaded cooperative within one instance: at most one pull
/// transaction and one push round-trip are ever in flight.
pub struct SyncEngine {
    db: Arc<ClientDatabase>,
    transport: Arc<dyn Transport>,
    handlers: HandlerRegistry,
    client_id: Uuid,
    partition_id: String,
    schema_version: i64,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
    mutation_timestamps: StdMutex<MutationTimestamps>,
    running: Arc<AtomicBool>,
    stop_signal: Arc<Notify>,
    loop_handles: Mutex<Vec<JoinHandle<()>>>,
}

const OUTBOX_BATCH_CAP: i64 = 25;
const PULL_LIMIT_COMMITS: u32 = 500;

impl SyncEngine {
    pub fn new(
        db: Arc<ClientDatabase>,
        transport: Arc<dyn Transport>,
        handlers: HandlerRegistry,
        client_id: Uuid,
        partition_id: impl Into<String>,
    ) -> Self {
        Self {
            db,
            transport,
            handlers,
            client_id,
            partition_id: partition_id.into(),
            schema_version: CURRENT_SCHEMA_VERSION,
            subscriptions: Mutex::new(Vec::new()),
            mutation_timestamps: StdMutex::new(MutationTimestamps::new()),
            running: Arc::new(AtomicBool::new(false)),
            stop_signal: Arc::new(Notify::new()),
            loop_handles: Mutex::new(Vec::new()),
        }
    }

    pub async fn subscribe(&self, table: impl Into<String>, scopes: Vec<String>, params: std::collections::HashMap<String, String>) -> Uuid {
        let id = Uuid::new_v4();
        self.subscriptions.lock().await.push(SubscriptionHandle {
            id,
            table: table.into(),
            scopes,
            params,
            bootstrap_state: None,
            cursor: 0,
        });
        id
    }

    /// Idempotent: a second call while already running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let outbox_loop = {
            let engine = self.clone();
            tokio::spawn(async move { engine.outbox_loop().await })
        };
        let pull_loop = {
            let engine = self.clone();
            tokio::spawn(async move { engine.pull_loop().await })
        };

        let mut handles = self.loop_handles.lock().await;
        handles.push(outbox_loop);
        handles.push(pull_loop);
    }

    /// Cooperative: sets the cancellation signal and waits for both loops
    /// to observe it between suspension points. Never interrupts a
    /// mid-apply transaction.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stop_signal.notify_waiters();

        let handles = {
            let mut guard = self.loop_handles.lock().await;
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn outbox_loop(&self) {
        let mut consecutive_failures: u32 = 0;
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            match self.push_once().await {
                Ok(_) => consecutive_failures = 0,
                Err(err) => {
                    tracing::warn!(?err, "push cycle failed");
                    consecutive_failures = consecutive_failures.saturating_add(1);
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(outbox_retry_delay(consecutive_failures)) => {}
                _ = self.stop_signal.notified() => return,
            }
        }
    }

    async fn pull_loop(&self) {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            if let Err(err) = self.pull_once().await {
                tracing::warn!(?err, "pull cycle failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(1000)) => {}
                _ = self.stop_signal.notified() => return,
            }
        }
    }

    /// Writes a row locally through its table handler and enqueues an
    /// outbox entry carrying the caller-supplied optimistic-concurrency
    /// baseline, recording the mutation timestamp used by fingerprinting.
    pub async fn apply_local_mutation(
        &self,
        table: &str,
        row_id: &str,
        op: OpKind,
        payload: Option<serde_json::Value>,
        base_version: Option<i64>,
    ) -> SyncResult<Uuid> {
        let handler = self.handlers.get(table);
        let mut tx = self.db.transact().await?;
        let local_change = WireChange {
            commit_seq: 0,
            seq_in_commit: 0,
            table: table.to_string(),
            row_id: row_id.to_string(),
            op,
            row_json: payload.clone(),
            row_version: base_version.unwrap_or(0) + 1,
            scope_keys: Vec::new(),
        };
        handler.apply_change(&mut *tx, &local_change).await?;
        tx.commit().await?;

        let client_commit_id = Uuid::new_v4();
        let outbox = Outbox::new(&self.db);
        outbox
            .enqueue(client_commit_id, vec![Op { table: table.to_string(), row_id: row_id.to_string(), op, payload, base_version }])
            .await?;

        self.mutation_timestamps.lock().expect("mutation timestamp lock poisoned").record(table, row_id, now_ms());
        Ok(client_commit_id)
    }

    /// Returns 0 if the row has no recorded local mutation.
    pub fn get_mutation_timestamp(&self, table: &str, row_id: &str) -> i64 {
        self.mutation_timestamps.lock().expect("mutation timestamp lock poisoned").get(table, row_id)
    }

    /// Discards the outbox entry behind a surfaced `ConflictReport`. Call
    /// this once the caller has decided how to reconcile the conflict
    /// (e.g. by applying a fresh mutation on top of the server's version);
    /// the engine itself never does this automatically.
    pub async fn resolve_conflict(&self, client_commit_id: Uuid) -> SyncResult<()> {
        let outbox = Outbox::new(&self.db);
        outbox.remove_by_client_commit_id(client_commit_id).await
    }

    /// Drains the outbox up to a batch cap, one transport round-trip per
    /// entry. Accepted entries are removed and recorded. Conflicting
    /// entries are surfaced as a `ConflictReport` but left in the outbox:
    /// the engine never auto-rebases, so the entry stays until the caller
    /// resolves it (by re-enqueuing a corrected mutation and removing the
    /// stale one) rather than being retried or discarded blindly.
    pub async fn push_once(&self) -> SyncResult<Vec<ConflictReport>> {
        let outbox = Outbox::new(&self.db);
        let queued = outbox.peek(OUTBOX_BATCH_CAP).await?;
        let mut conflicts = Vec::new();

        for entry in queued {
            let request = Request {
                client_id: self.client_id,
                push: Some(PushRequest {
                    client_id: self.client_id,
                    client_commit_id: entry.client_commit_id,
                    operations: entry.operations.clone(),
                    schema_version: self.schema_version,
                }),
                pull: None,
            };

            match self.transport.send(request).await {
                Ok(response) => {
                    if let Some(push_response) = response.push {
                        if push_response.conflicts.is_empty() {
                            outbox.remove(entry.id).await?;
                            for op in &entry.operations {
                                self.mutation_timestamps
                                    .lock()
                                    .expect("mutation timestamp lock poisoned")
                                    .record(&op.table, &op.row_id, now_ms());
                            }
                        } else {
                            for conflict in push_response.conflicts {
                                let table = entry
                                    .operations
                                    .iter()
                                    .find(|op| op.row_id == conflict.row_id)
                                    .map(|op| op.table.clone())
                                    .unwrap_or_default();
                                conflicts.push(ConflictReport {
                                    table,
                                    row_id: conflict.row_id,
                                    expected_base_version: conflict.expected_base_version,
                                    actual_row_version: conflict.actual_row_version,
                                    client_commit_id: entry.client_commit_id,
                                });
                            }
                        }
                    }
                }
                Err(err) => {
                    outbox.mark_retry(entry.id, &err.to_string()).await?;
                    if !err.is_retryable() {
                        return Err(err);
                    }
                }
            }
        }

        Ok(conflicts)
    }

    /// Issues one pull for all registered subscriptions and applies the
    /// response in a single transaction.
    pub async fn pull_once(&self) -> SyncResult<()> {
        let subs = self.subscriptions.lock().await;
        if subs.is_empty() {
            return Ok(());
        }
        let pull_request = self.build_pull_request(&subs);
        drop(subs);

        let request = Request { client_id: self.client_id, push: None, pull: Some(pull_request) };
        let response = self.transport.send(request).await?;

        if let Some(pull_response) = response.pull {
            self.apply_pull_response(pull_response).await?;
        }
        Ok(())
    }

    /// `pushOnce` then `pullOnce` collapsed into one transport round-trip:
    /// at most one outbox entry and the pull request share a single
    /// envelope.
    pub async fn sync_once(&self) -> SyncResult<Vec<ConflictReport>> {
        let outbox = Outbox::new(&self.db);
        let queued = outbox.peek(1).await?;

        let subs = self.subscriptions.lock().await;
        let pull_request = if subs.is_empty() { None } else { Some(self.build_pull_request(&subs)) };
        drop(subs);

        let push_request = queued.first().map(|entry| PushRequest {
            client_id: self.client_id,
            client_commit_id: entry.client_commit_id,
            operations: entry.operations.clone(),
            schema_version: self.schema_version,
        });

        if push_request.is_none() && pull_request.is_none() {
            return Ok(Vec::new());
        }

        let request = Request { client_id: self.client_id, push: push_request, pull: pull_request };
        let response = self.transport.send(request).await?;
        let mut conflicts = Vec::new();

        if let (Some(push_response), Some(entry)) = (response.push, queued.first()) {
            if push_response.conflicts.is_empty() {
                outbox.remove(entry.id).await?;
            } else {
                for conflict in push_response.conflicts {
                    let table = entry
                        .operations
                        .iter()
                        .find(|op| op.row_id == conflict.row_id)
                        .map(|op| op.table.clone())
                        .unwrap_or_default();
                    conflicts.push(ConflictReport {
                        table,
                        row_id: conflict.row_id,
                        expected_base_version: conflict.expected_base_version,
                        actual_row_version: conflict.actual_row_version,
                        client_commit_id: entry.client_commit_id,
                    });
                }
            }
        }

        if let Some(pull_response) = response.pull {
            self.apply_pull_response(pull_response).await?;
        }

        Ok(conflicts)
    }

    fn build_pull_request(&self, subs: &[SubscriptionHandle]) -> PullRequest {
        PullRequest {
            client_id: self.client_id,
            subscriptions: subs
                .iter()
                .map(|s| Sub {
                    id: s.id,
                    table: s.table.clone(),
                    scopes: s.scopes.clone(),
                    params: s.params.clone(),
                    cursor: s.cursor,
                    bootstrap_state: s.bootstrap_state.clone(),
                })
                .collect(),
            limit_commits: PULL_LIMIT_COMMITS,
            limit_snapshot_rows: Some(500),
            max_snapshot_pages: Some(20),
            dedupe_rows: Some(true),
        }
    }

    /// Begins a transaction, applies every snapshot page then every change
    /// through its table handler, persists subscription bootstrap state and
    /// the client cursor, and commits all of it atomically. On any failure
    /// the whole transaction rolls back and neither the cursor nor bootstrap
    /// state advances, so a retried pull starts from the same place.
    async fn apply_pull_response(&self, response: sync_core::protocol::PullResponse) -> SyncResult<()> {
        let mut tx = self.db.transact().await?;

        for snap in &response.snapshots {
            let handler = self.handlers.get(&snap.table);
            if snap.is_first_page {
                handler.on_snapshot_start(&mut *tx, snap.subscription_id).await?;
            }
            handler.apply_snapshot(&mut *tx, snap.subscription_id, &snap.rows).await?;
        }

        for change in &response.changes {
            let handler = self.handlers.get(&change.table);
            handler.apply_change(&mut *tx, change).await?;
        }

        {
            let mut subs = self.subscriptions.lock().await;
            for state in &response.subscription_states {
                let Some(sub) = subs.iter_mut().find(|s| s.id == state.id) else { continue };
                sub.bootstrap_state = state.bootstrap_state.clone();
                if let Some(BootstrapState::CaughtUp { cursor }) = state.bootstrap_state {
                    sub.cursor = cursor;
                }

                let bootstrap_state_json =
                    serde_json::to_string(&sub.bootstrap_state).map_err(sync_core::SyncError::Serialization)?;
                tx.query(
                    "INSERT INTO sync_subscription_state (subscription_id, table_name, bootstrap_state, cursor) VALUES (?, ?, ?, ?)\n                     ON CONFLICT(subscription_id) DO UPDATE SET table_name = excluded.table_name, bootstrap_state = excluded.bootstrap_state, cursor = excluded.cursor",
                    &[
                        serde_json::Value::String(sub.id.to_string()),
                        serde_json::Value::String(sub.table.clone()),
                        serde_json::Value::String(bootstrap_state_json),
                        serde_json::json!(sub.cursor),
                    ],
                )
                .await?;
            }
        }

        tx.query(
            "INSERT INTO sync_client_cursors (partition_id, cursor, updated_at) VALUES (?, ?, ?)\n             ON CONFLICT(partition_id) DO UPDATE SET cursor = excluded.cursor, updated_at = excluded.updated_at",
            &[
                serde_json::Value::String(self.partition_id.clone()),
                serde_json::json!(response.cursor),
                serde_json::Value::String(chrono::Utc::now().to_rfc3339()),
            ],
        )
        .await?;

        tx.commit().await?;

        Ok(())
    }
}

/// Coalesces concurrent attempts to open the local database, run its
/// migrations, and wire up the sync engine for the same `client_id` into a
/// single initialization: the mechanism `AsyncInitRegistry` exists for.
/// Safe to share across tasks that might race to obtain a client's engine
/// (e.g. on process start with several entry points resolving the same id).
pub struct SyncEngineRegistry {
    inner: sync_core::AsyncInitRegistry<Uuid, Arc<SyncEngine>>,
}

impl Default for SyncEngineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncEngineRegistry {
    pub fn new() -> Self {
        Self { inner: sync_core::AsyncInitRegistry::new() }
    }

    /// Opens `database_url`, runs schema bootstrap, and constructs the
    /// engine at most once per `client_id`; concurrent callers for the same
    /// id share the one engine that was actually constructed.
    pub async fn get_or_init(
        &self,
        client_id: Uuid,
        database_url: &str,
        transport: Arc<dyn Transport>,
        handlers: HandlerRegistry,
        partition_id: impl Into<String>,
    ) -> SyncResult<Arc<SyncEngine>> {
        let database_url = database_url.to_string();
        let partition_id = partition_id.into();
        self.inner
            .run(client_id, move || async move {
                let db = Arc::new(ClientDatabase::new(&database_url).await?);
                db.init_schema().await?;
                Ok(Arc::new(SyncEngine::new(db, transport, handlers, client_id, partition_id)))
            })
            .await
    }

    /// Forces the next `get_or_init` call for `client_id` to reinitialize,
    /// e.g. after the caller has torn the engine down deliberately.
    pub async fn invalidate(&self, client_id: Uuid) {
        self.inner.invalidate(&client_id).await
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Exponential backoff with a 500ms base, doubling per consecutive failure,
/// capped at 30s. Zero failures keeps the normal 500ms flush cadence.
fn outbox_retry_delay(consecutive_failures: u32) -> Duration {
    const BASE_MS: u64 = 500;
    const CAP_MS: u64 = 30_000;
    let shift = consecutive_failures.min(6);
    Duration::from_millis((BASE_MS << shift).min(CAP_MS))
}

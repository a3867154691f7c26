use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::{Display, EnumString};
use uuid::Uuid;

/// Operation kind carried by a single row-level change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OpKind {
    Upsert,
    Delete,
}

/// Ordered, server-assigned atomic unit of the commit log.
///
/// `commit_seq` is unique and strictly increasing within a `partition_id`;
/// `(client_id, client_commit_id)` is unique, making replayed pushes safe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub commit_seq: i64,
    pub partition_id: String,
    pub client_id: Uuid,
    pub client_commit_id: Uuid,
    pub actor_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A single row-level operation inside a commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    pub commit_seq: i64,
    pub seq_in_commit: i32,
    pub table: String,
    pub row_id: String,
    pub op: OpKind,
    pub row_json: Option<serde_json::Value>,
    pub row_version: i64,
    pub scope_keys: Vec<String>,
}

/// Latest known version for a `(table, row_id)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowVersion {
    pub table: String,
    pub row_id: String,
    pub row_version: i64,
    pub tombstoned: bool,
}

/// Connection liveness/activity reported by a client, surfaced in the
/// cursor row for operational visibility; not part of the sync algorithm.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionMode {
    Http,
    Websocket,
    Offline,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActivityState {
    Active,
    Idle,
}

/// Server-side record of how far a client has durably pulled, and under
/// which effective scope set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientCursor {
    pub partition_id: String,
    pub client_id: Uuid,
    pub actor_id: Option<String>,
    pub cursor: i64,
    pub scopes: Vec<String>,
    pub updated_at: DateTime<Utc>,
    pub connection_mode: ConnectionMode,
    pub activity_state: ActivityState,
}

/// Per-subscription snapshot progress. `SnapshotInProgress` carries the page
/// number about to be requested next and the `commit_seq` the whole snapshot
/// is pinned to, fixed when page 0 was first served: every later page of the
/// same snapshot must be read as of that same point, not a moving head.
/// `CaughtUp` carries the cursor the subscription has fully applied through.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BootstrapState {
    PendingSnapshot,
    SnapshotInProgress { page: u32, anchor_commit_seq: i64 },
    CaughtUp { cursor: i64 },
}

/// A client-side declared interest in rows matching scope patterns for a
/// table, with its own independent bootstrap progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub client_id: Uuid,
    pub subscription_id: Uuid,
    pub table: String,
    pub scope_patterns: Vec<String>,
    pub params: HashMap<String, String>,
    pub bootstrap_state: Option<BootstrapState>,
    pub cursor: i64,
}

/// A pending local commit not yet accepted by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub client_commit_id: Uuid,
    pub operations: Vec<crate::protocol::Op>,
    pub created_at: DateTime<Utc>,
    pub attempts: i32,
    pub last_error: Option<String>,
}

/// In-memory `(table, row_id) -> timestamp` map recording local mutations,
/// consulted by fingerprinting and cleared on engine shutdown.
#[derive(Debug, Clone, Default)]
pub struct MutationTimestamps {
    inner: HashMap<(String, String), i64>,
}

impl MutationTimestamps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, table: &str, row_id: &str, timestamp_ms: i64) {
        self.inner.insert((table.to_string(), row_id.to_string()), timestamp_ms);
    }

    pub fn get(&self, table: &str, row_id: &str) -> i64 {
        self.inner
            .get(&(table.to_string(), row_id.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

/// Compact digest of a query result's identity + staleness.
///
/// Two queries whose fingerprints are equal are guaranteed to have
/// identical materializations to the engine's knowledge. Order-sensitive
/// by design: re-ordered rows must produce a different fingerprint.
pub fn compute_fingerprint(
    rows: &[serde_json::Value],
    mutation_timestamps: &MutationTimestamps,
    table: &str,
    key_field: &str,
) -> String {
    let mut parts = Vec::with_capacity(rows.len());
    for row in rows {
        let key = match row.get(key_field) {
            Some(serde_json::Value::Null) | None => String::new(),
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        };
        let ts = mutation_timestamps.get(table, &key);
        parts.push(format!("{key}@{ts}"));
    }
    format!("{}:{}", rows.len(), parts.join(","))
}

/// Returns true iff every row carries the key field, so a fingerprint can
/// be meaningfully computed. An empty row set always fingerprints.
pub fn can_fingerprint(rows: &[serde_json::Value], key_field: &str) -> bool {
    rows.iter().all(|row| row.get(key_field).is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_empty_rows() {
        let ts = MutationTimestamps::new();
        assert_eq!(compute_fingerprint(&[], &ts, "widgets", "id"), "0:");
    }

    #[test]
    fn fingerprint_reflects_mutation_timestamps() {
        let mut ts = MutationTimestamps::new();
        ts.record("widgets", "a", 42);
        let rows = vec![serde_json::json!({"id": "a"}), serde_json::json!({"id": "b"})];
        let fp = compute_fingerprint(&rows, &ts, "widgets", "id");
        assert_eq!(fp, "2:a@42,b@0");
    }

    #[test]
    fn fingerprint_is_order_sensitive() {
        let ts = MutationTimestamps::new();
        let forward = vec![serde_json::json!({"id": "a"}), serde_json::json!({"id": "b"})];
        let backward = vec![serde_json::json!({"id": "b"}), serde_json::json!({"id": "a"})];
        assert_ne!(
            compute_fingerprint(&forward, &ts, "widgets", "id"),
            compute_fingerprint(&backward, &ts, "widgets", "id")
        );
    }

    #[test]
    fn can_fingerprint_requires_key_field() {
        let rows = vec![serde_json::json!({"id": "a"}), serde_json::json!({"name": "no id"})];
        assert!(!can_fingerprint(&rows, "id"));
        assert!(can_fingerprint(&[], "id"));
    }

    #[test]
    fn fingerprint_coerces_null_key_to_empty_string() {
        let mut ts = MutationTimestamps::new();
        ts.record("widgets", "", 7);
        let rows = vec![serde_json::json!({"id": null})];
        assert_eq!(compute_fingerprint(&rows, &ts, "widgets", "id"), "1:@7");
    }

    #[test]
    fn mutation_timestamps_default_to_zero() {
        let ts = MutationTimestamps::new();
        assert_eq!(ts.get("widgets", "missing"), 0);
    }
}

use crate::models::{BootstrapState, OpKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Wire schema version this build speaks. A client whose `PushRequest`
/// carries a different value is rejected with `SchemaMismatch` before any
/// operation is applied.
pub const CURRENT_SCHEMA_VERSION: i64 = 1;

/// Combined push/pull envelope sent by a client in one round trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub client_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push: Option<PushRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull: Option<PullRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    pub client_id: Uuid,
    pub client_commit_id: Uuid,
    pub operations: Vec<Op>,
    pub schema_version: i64,
}

/// A single client-proposed row operation. `base_version` is `None` for a
/// blind write (no optimistic-concurrency check), `Some(v)` to assert the
/// row's current version is `v`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Op {
    pub table: String,
    pub row_id: String,
    pub op: OpKind,
    pub payload: Option<serde_json::Value>,
    pub base_version: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub client_id: Uuid,
    pub subscriptions: Vec<Sub>,
    pub limit_commits: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_snapshot_rows: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_snapshot_pages: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_rows: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sub {
    pub id: Uuid,
    pub table: String,
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub params: HashMap<String, String>,
    pub cursor: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_state: Option<BootstrapState>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push: Option<PushResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull: Option<PullResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushResponse {
    pub accepted_commit_seq: i64,
    pub conflicts: Vec<Conflict>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullResponse {
    pub snapshots: Vec<Snap>,
    pub changes: Vec<Change>,
    pub cursor: i64,
    pub subscription_states: Vec<SubState>,
    pub more: bool,
}

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

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snap {
    pub table: String,
    pub rows: Vec<serde_json::Value>,
    pub is_first_page: bool,
    pub is_last_page: bool,
    pub subscription_id: Uuid,
    pub anchor_commit_seq: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub row_id: String,
    pub expected_base_version: Option<i64>,
    pub actual_row_version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubState {
    pub id: Uuid,
    pub bootstrap_state: Option<BootstrapState>,
}

/// Advisory, never authoritative: a subscriber always re-confirms state by
/// pulling; this just wakes that pull up sooner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RealtimeEvent {
    Commit {
        commit_seq: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        partition_id: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        scope_keys: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        source_instance_id: Option<Uuid>,
    },
}

//! End-to-end push/pull scenarios against a real Postgres database.
//! Skips gracefully when `TEST_DATABASE_URL` is unset, matching the
//! teacher's `test_server_database_operations` pattern.

use std::collections::HashMap;
use sync_core::models::OpKind;
use sync_core::protocol::{Op, Sub};
use sync_server::database::ServerDatabase;
use uuid::Uuid;

async fn test_db() -> Option<ServerDatabase> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    let db = ServerDatabase::new(&url).await.ok()?;
    db.init_schema().await.ok()?;
    Some(db)
}

fn resolve_global(_table: &str, _row_id: &str, _payload: Option<&serde_json::Value>) -> Vec<String> {
    vec!["global".to_string()]
}

#[tokio::test]
async fn commit_seq_strictly_increases_per_partition() {
    let Some(db) = test_db().await else {
        println!("skipping: TEST_DATABASE_URL not set");
        return;
    };

    let partition = format!("p-{}", Uuid::new_v4());
    let client_id = Uuid::new_v4();
    let mut last_seq = 0;

    for i in 0..5 {
        let ops = vec![Op {
            table: "widgets".to_string(),
            row_id: format!("w{i}"),
            op: OpKind::Upsert,
            payload: Some(serde_json::json!({"id": format!("w{i}")})),
            base_version: None,
        }];
        let (seq, conflicts) = db.push(&partition, client_id, Uuid::new_v4(), None, &ops, resolve_global).await.unwrap();
        assert!(conflicts.is_empty());
        assert!(seq > last_seq, "commit_seq must strictly increase");
        last_seq = seq;
    }
}

#[tokio::test]
async fn duplicate_client_commit_id_is_idempotent() {
    let Some(db) = test_db().await else {
        println!("skipping: TEST_DATABASE_URL not set");
        return;
    };

    let partition = format!("p-{}", Uuid::new_v4());
    let client_id = Uuid::new_v4();
    let client_commit_id = Uuid::new_v4();
    let ops = vec![Op {
        table: "widgets".to_string(),
        row_id: "w1".to_string(),
        op: OpKind::Upsert,
        payload: Some(serde_json::json!({"id": "w1"})),
        base_version: None,
    }];

    let (seq1, conflicts1) = db.push(&partition, client_id, client_commit_id, None, &ops, resolve_global).await.unwrap();
    let (seq2, conflicts2) = db.push(&partition, client_id, client_commit_id, None, &ops, resolve_global).await.unwrap();

    assert_eq!(seq1, seq2, "replaying the same client_commit_id must return the same commit_seq");
    assert_eq!(conflicts1.len(), conflicts2.len());
}

#[tokio::test]
async fn push_then_pull_cursor_reaches_accepted_commit_seq() {
    let Some(db) = test_db().await else {
        println!("skipping: TEST_DATABASE_URL not set");
        return;
    };

    let partition = format!("p-{}", Uuid::new_v4());
    let client_id = Uuid::new_v4();
    let ops = vec![Op {
        table: "widgets".to_string(),
        row_id: "w1".to_string(),
        op: OpKind::Upsert,
        payload: Some(serde_json::json!({"id": "w1", "name": "thing"})),
        base_version: None,
    }];

    let (accepted_seq, conflicts) = db.push(&partition, client_id, Uuid::new_v4(), None, &ops, resolve_global).await.unwrap();
    assert!(conflicts.is_empty());

    let sub = Sub {
        id: Uuid::new_v4(),
        table: "widgets".to_string(),
        scopes: vec!["global".to_string()],
        params: HashMap::new(),
        cursor: 0,
        bootstrap_state: None,
    };

    let (_snapshots, _changes, states, _more) = db.pull(&partition, &[sub], 100, 100, None, None).await.unwrap();

    let caught_up_cursor = states.iter().find_map(|s| match s.bootstrap_state {
        Some(sync_core::models::BootstrapState::CaughtUp { cursor }) => Some(cursor),
        _ => None,
    });

    assert!(caught_up_cursor.unwrap_or(0) >= accepted_seq, "cursor must reach at least the accepted commit_seq (R1)");
}

#[tokio::test]
async fn conflicting_base_version_is_rejected_without_advancing_row_version() {
    let Some(db) = test_db().await else {
        println!("skipping: TEST_DATABASE_URL not set");
        return;
    };

    let partition = format!("p-{}", Uuid::new_v4());
    let client_id = Uuid::new_v4();

    let first = vec![Op {
        table: "widgets".to_string(),
        row_id: "w1".to_string(),
        op: OpKind::Upsert,
        payload: Some(serde_json::json!({"id": "w1", "name": "v1"})),
        base_version: None,
    }];
    db.push(&partition, client_id, Uuid::new_v4(), None, &first, resolve_global).await.unwrap();

    let stale_update = vec![Op {
        table: "widgets".to_string(),
        row_id: "w1".to_string(),
        op: OpKind::Upsert,
        payload: Some(serde_json::json!({"id": "w1", "name": "v2-stale"})),
        base_version: Some(0),
    }];
    let (_seq, conflicts) = db.push(&partition, client_id, Uuid::new_v4(), None, &stale_update, resolve_global).await.unwrap();

    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].row_id, "w1");
}

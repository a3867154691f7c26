pub mod api;
pub mod auth;
pub mod database;
pub mod monitoring;
pub mod sync_handler;
pub mod websocket;

use std::sync::Arc;
use sync_core::{Broadcaster, InProcessBroadcaster, RateLimiter, ScopeEngine};
use uuid::Uuid;

pub use auth::AuthState;
pub use database::ServerDatabase;

/// Shared application state reachable from both the HTTP and WebSocket
/// transports. `instance_id` tags realtime events this process publishes
/// so a connection never reacts to the echo of its own write.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<database::ServerDatabase>,
    pub auth: auth::AuthState,
    pub monitoring: Option<monitoring::MonitoringLayer>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub scope_engine: Arc<ScopeEngine>,
    pub push_limiter: Arc<RateLimiter>,
    pub partition_id: String,
    pub instance_id: Uuid,
}

impl AppState {
    pub fn new(db: Arc<database::ServerDatabase>, partition_id: String, scope_engine: ScopeEngine) -> Self {
        Self {
            auth: auth::AuthState::new(db.clone()),
            db,
            monitoring: None,
            broadcaster: Arc::new(InProcessBroadcaster::default()),
            scope_engine: Arc::new(scope_engine),
            push_limiter: Arc::new(RateLimiter::new(1_000, 50)),
            partition_id,
            instance_id: Uuid::new_v4(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_server_database_operations() {
        let db_url = match std::env::var("TEST_DATABASE_URL") {
            Ok(url) => url,
            Err(_) => {
                println!("skipping: TEST_DATABASE_URL not set");
                return;
            }
        };

        let db = database::ServerDatabase::new(&db_url).await.unwrap();
        db.init_schema().await.unwrap();

        let client_id = Uuid::new_v4();
        let ops = vec![sync_core::protocol::Op {
            table: "widgets".to_string(),
            row_id: "w1".to_string(),
            op: sync_core::models::OpKind::Upsert,
            payload: Some(serde_json::json!({"id": "w1"})),
            base_version: None,
        }];

        let (commit_seq, conflicts) = db
            .push("default", client_id, Uuid::new_v4(), None, &ops, |_, _, _| vec!["global".to_string()])
            .await
            .unwrap();

        assert!(commit_seq > 0);
        assert!(conflicts.is_empty());
    }
}

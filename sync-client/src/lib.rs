pub mod database;
pub mod handlers;
pub mod outbox;
pub mod sync_engine;
pub mod transport;

pub use database::ClientDatabase;
pub use handlers::HandlerRegistry;
pub use sync_engine::{ConflictReport, SyncEngine, SyncEngineRegistry};
pub use transport::{HttpTransport, Transport, WebSocketTransport};

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::models::OpKind;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_client_database_schema_and_outbox_roundtrip() {
        let db = std::sync::Arc::new(ClientDatabase::new("sqlite::memory:").await.unwrap());
        db.init_schema().await.unwrap();

        let outbox = outbox::Outbox::new(&db);
        let client_commit_id = Uuid::new_v4();
        let ops = vec![sync_core::protocol::Op {
            table: "widgets".to_string(),
            row_id: "w1".to_string(),
            op: OpKind::Upsert,
            payload: Some(serde_json::json!({"id": "w1", "name": "Thing"})),
            base_version: None,
        }];

        let id = outbox.enqueue(client_commit_id, ops).await.unwrap();
        let queued = outbox.peek(10).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, id);

        outbox.remove(id).await.unwrap();
        let queued = outbox.peek(10).await.unwrap();
        assert!(queued.is_empty());
    }

    #[tokio::test]
    async fn test_apply_local_mutation_writes_row_and_enqueues_outbox() {
        let db = std::sync::Arc::new(ClientDatabase::new("sqlite::memory:").await.unwrap());
        db.init_schema().await.unwrap();

        let transport: std::sync::Arc<dyn Transport> = std::sync::Arc::new(NoopTransport);
        let engine = SyncEngine::new(db.clone(), transport, HandlerRegistry::new(), Uuid::new_v4(), "default");

        engine
            .apply_local_mutation("widgets", "w1", OpKind::Upsert, Some(serde_json::json!({"id": "w1"})), None)
            .await
            .unwrap();

        assert!(engine.get_mutation_timestamp("widgets", "w1") > 0);

        let outbox = outbox::Outbox::new(&db);
        let queued = outbox.peek(10).await.unwrap();
        assert_eq!(queued.len(), 1);
    }

    #[tokio::test]
    async fn registry_coalesces_concurrent_init_for_same_client_id() {
        let registry = std::sync::Arc::new(SyncEngineRegistry::new());
        let client_id = Uuid::new_v4();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let transport: std::sync::Arc<dyn Transport> = std::sync::Arc::new(NoopTransport);
                registry
                    .get_or_init(client_id, "sqlite::memory:", transport, HandlerRegistry::new(), "default")
                    .await
                    .unwrap()
            }));
        }

        let first = handles.remove(0).await.unwrap();
        for handle in handles {
            let engine = handle.await.unwrap();
            assert!(std::sync::Arc::ptr_eq(&first, &engine), "all callers must share one engine");
        }
    }

    struct NoopTransport;

    #[async_trait::async_trait]
    impl Transport for NoopTransport {
        async fn send(&self, _request: sync_core::protocol::Request) -> sync_core::SyncResult<sync_core::protocol::Response> {
            Ok(sync_core::protocol::Response::default())
        }
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use sync_core::handler::{JsonRowHandler, TableHandler};

/// Per-table dispatch: the engine holds one handler per table name and
/// falls back to a `JsonRowHandler` for any table without a bespoke one
/// registered, so every subscribed table is materialized somewhere.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TableHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, table: impl Into<String>, handler: Arc<dyn TableHandler>) {
        self.handlers.insert(table.into(), handler);
    }

    pub fn get(&self, table: &str) -> Arc<dyn TableHandler> {
        self.handlers
            .get(table)
            .cloned()
            .unwrap_or_else(|| Arc::new(JsonRowHandler::new(table.to_string())))
    }
}

//! Client-server data-synchronization engine.
//!
//! # Example
//!
//! ```ignore
//! use sync::ClientEngine;
//!
//! let engine = ClientEngine::new(db, transport, handlers, client_id, "default").await?;
//! engine.start().await;
//! ```

pub use sync_client::{ClientDatabase, ConflictReport, HandlerRegistry, HttpTransport, SyncEngine as ClientEngine, Transport, WebSocketTransport};
pub use sync_server::{database::ServerDatabase, AppState as Server};

pub use sync_core::errors::SyncError;
pub use sync_core::models::{Change, Commit, OpKind};
pub use sync_core::protocol::{Request, Response};
pub use sync_core::SyncResult;

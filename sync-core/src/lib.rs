pub mod async_init;
pub mod broadcaster;
pub mod errors;
pub mod handler;
pub mod models;
pub mod protocol;
pub mod rate_limit;
pub mod scope;
pub mod storage;

pub type SyncResult<T> = Result<T, SyncError>;
pub use async_init::AsyncInitRegistry;
pub use broadcaster::{Broadcaster, InProcessBroadcaster};
pub use errors::*;
pub use handler::{JsonRowHandler, TableHandler};
pub use models::*;
pub use protocol::*;
pub use rate_limit::RateLimiter;
pub use scope::{ScopeEngine, ScopePattern};
pub use storage::{Row, Storage, Transaction};

//! Offline inbox and sync.
//!
//! The inbox is the system of record for notifications. The delivery router
//! writes here first; real-time push is an optimization on top. Clients pull
//! undelivered notifications on reconnect and acknowledge them.
//!
//! - `MemoryInboxBackend`: DashMap storage, lost on restart
//! - `PostgresInboxBackend`: `inbox_notifications` table

mod backend;
mod factory;
mod memory_backend;
mod postgres_backend;
mod sync;

pub use backend::{InboxBackend, InboxError, InboxStats, RetentionPolicy};
pub use factory::create_inbox_backend;
pub use memory_backend::MemoryInboxBackend;
pub use postgres_backend::PostgresInboxBackend;
pub use sync::{pull_undelivered, SyncBatch};

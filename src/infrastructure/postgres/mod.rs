//! PostgreSQL persistence: connection pool and schema bootstrap for the inbox
//! and approval stores.

pub mod pool;

pub use pool::{mask_url, PostgresPool, PostgresPoolError};

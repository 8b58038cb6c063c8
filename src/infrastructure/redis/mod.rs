//! Redis connectivity for the stream-backed broker.

pub mod pool;

pub use pool::{PoolError, RedisPool};

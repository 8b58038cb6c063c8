//! Infrastructure layer modules
//!
//! - `auth`: JWT validation for clients
//! - `config`: layered settings
//! - `error`: HTTP error type and the pipeline error taxonomy
//! - `metrics`: Prometheus metrics helpers
//! - `postgres`: PostgreSQL pool and schema bootstrap
//! - `redis`: Redis connection for the stream broker
//! - `resilience`: backoff and circuit breaking

pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;
pub mod postgres;
pub mod redis;
pub mod resilience;

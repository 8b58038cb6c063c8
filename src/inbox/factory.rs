//! Inbox backend factory

use std::sync::Arc;

use crate::config::InboxConfig;
use crate::postgres::PostgresPool;

use super::backend::InboxBackend;
use super::memory_backend::MemoryInboxBackend;
use super::postgres_backend::PostgresInboxBackend;

/// Create an inbox backend based on configuration.
///
/// - `"postgres"`: `PostgresInboxBackend`, if a pool is provided
/// - `"memory"` (default): `MemoryInboxBackend`
pub fn create_inbox_backend(
    settings: &InboxConfig,
    postgres_pool: Option<Arc<PostgresPool>>,
) -> Arc<dyn InboxBackend> {
    match settings.backend.as_str() {
        "postgres" => {
            if let Some(pool) = postgres_pool {
                tracing::info!(backend = "postgres", "Creating PostgreSQL inbox backend");
                Arc::new(PostgresInboxBackend::new(pool))
            } else {
                tracing::warn!(
                    "PostgreSQL inbox requested but no pool provided, falling back to memory"
                );
                Arc::new(MemoryInboxBackend::new())
            }
        }
        _ => {
            tracing::info!(backend = "memory", "Creating memory inbox backend");
            Arc::new(MemoryInboxBackend::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgres_without_pool_falls_back_to_memory() {
        let settings = InboxConfig {
            backend: "postgres".to_string(),
            ..InboxConfig::default()
        };
        assert_eq!(create_inbox_backend(&settings, None).name(), "memory");
    }
}

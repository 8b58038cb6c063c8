//! Approval and independence store factories

use std::sync::Arc;

use crate::config::{GuardianConfig, IndependenceConfig};
use crate::postgres::PostgresPool;

use super::independence_store::{
    IndependenceStore, MemoryIndependenceStore, PostgresIndependenceStore,
};
use super::store::{ApprovalStore, MemoryApprovalStore, PostgresApprovalStore};

/// Create an approval store based on configuration.
///
/// - `"postgres"`: `PostgresApprovalStore`, if a pool is provided
/// - `"memory"` (default): `MemoryApprovalStore`
pub fn create_approval_store(
    settings: &GuardianConfig,
    postgres_pool: Option<Arc<PostgresPool>>,
) -> Arc<dyn ApprovalStore> {
    match (settings.backend.as_str(), postgres_pool) {
        ("postgres", Some(pool)) => {
            tracing::info!(backend = "postgres", "Creating PostgreSQL approval store");
            Arc::new(PostgresApprovalStore::new(pool))
        }
        ("postgres", None) => {
            tracing::warn!(
                "PostgreSQL approval store requested but no pool provided, falling back to memory"
            );
            Arc::new(MemoryApprovalStore::new())
        }
        _ => {
            tracing::info!(backend = "memory", "Creating memory approval store");
            Arc::new(MemoryApprovalStore::new())
        }
    }
}

/// Create an independence profile store. Same selection rules as
/// [`create_approval_store`].
pub fn create_independence_store(
    settings: &IndependenceConfig,
    postgres_pool: Option<Arc<PostgresPool>>,
) -> Arc<dyn IndependenceStore> {
    match (settings.backend.as_str(), postgres_pool) {
        ("postgres", Some(pool)) => {
            tracing::info!(backend = "postgres", "Creating PostgreSQL independence store");
            Arc::new(PostgresIndependenceStore::new(pool))
        }
        ("postgres", None) => {
            tracing::warn!(
                "PostgreSQL independence store requested but no pool provided, falling back to memory"
            );
            Arc::new(MemoryIndependenceStore::new())
        }
        _ => Arc::new(MemoryIndependenceStore::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_memory() {
        assert_eq!(create_approval_store(&GuardianConfig::default(), None).name(), "memory");
    }

    #[test]
    fn test_postgres_without_pool_falls_back() {
        let settings = GuardianConfig {
            backend: "postgres".into(),
            ..GuardianConfig::default()
        };
        assert_eq!(create_approval_store(&settings, None).name(), "memory");
    }

    #[test]
    fn test_independence_store_falls_back_without_pool() {
        assert_eq!(
            create_independence_store(&IndependenceConfig::default(), None).name(),
            "memory"
        );
        let settings = IndependenceConfig {
            backend: "postgres".into(),
            ..IndependenceConfig::default()
        };
        assert_eq!(create_independence_store(&settings, None).name(), "memory");
    }
}

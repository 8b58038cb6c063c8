//! Account directory factory

use std::sync::Arc;

use crate::config::DirectoryConfig;
use crate::postgres::PostgresPool;

use super::{AccountDirectory, MemoryAccountDirectory, PostgresAccountDirectory};

/// Create an account directory based on configuration.
///
/// - `"postgres"`: `PostgresAccountDirectory`, if a pool is provided
/// - `"memory"` (default): `MemoryAccountDirectory`
pub fn create_account_directory(
    settings: &DirectoryConfig,
    postgres_pool: Option<Arc<PostgresPool>>,
) -> Arc<dyn AccountDirectory> {
    match (settings.backend.as_str(), postgres_pool) {
        ("postgres", Some(pool)) => {
            tracing::info!(backend = "postgres", "Creating PostgreSQL account directory");
            Arc::new(PostgresAccountDirectory::new(pool))
        }
        ("postgres", None) => {
            tracing::warn!(
                "PostgreSQL account directory requested but no pool provided, falling back to memory; minor flags will not survive a restart"
            );
            Arc::new(MemoryAccountDirectory::new())
        }
        _ => {
            tracing::info!(backend = "memory", "Creating memory account directory");
            Arc::new(MemoryAccountDirectory::new())
        }
    }
}

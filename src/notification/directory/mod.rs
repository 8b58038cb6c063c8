//! Account directory: who is a minor, who guards them, who has graduated.
//!
//! - `MemoryAccountDirectory`: DashMap storage, lost on restart
//! - `PostgresAccountDirectory`: `account_profiles` table
//!
//! The kid-safety gate trusts whatever this returns, so deployments that
//! serve minors should run the Postgres backend.

mod factory;
mod memory_backend;
mod postgres_backend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::postgres::PostgresPoolError;

pub use factory::create_account_directory;
pub use memory_backend::MemoryAccountDirectory;
pub use postgres_backend::PostgresAccountDirectory;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("account not found: {0}")]
    NotFound(String),

    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

impl From<PostgresPoolError> for DirectoryError {
    fn from(err: PostgresPoolError) -> Self {
        DirectoryError::Unavailable(err.to_string())
    }
}

/// The parts of an account the notification pipeline cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountProfile {
    pub user_id: String,
    #[serde(default)]
    pub is_minor: bool,
    /// Primary guardian; required for minors to receive guardian-gated traffic
    #[serde(default)]
    pub guardian_id: Option<String>,
    /// Set once the independence transition completes
    #[serde(default)]
    pub independent: bool,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl AccountProfile {
    /// Unknown accounts are treated as adults without a guardian.
    pub fn adult(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            is_minor: false,
            guardian_id: None,
            independent: false,
            display_name: None,
        }
    }

    pub fn minor(user_id: impl Into<String>, guardian_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            is_minor: true,
            guardian_id: Some(guardian_id.into()),
            independent: false,
            display_name: None,
        }
    }

    /// Minors stay gated until independence completes.
    pub fn is_gated(&self) -> bool {
        self.is_minor && !self.independent
    }
}

#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// Profile for `user_id`; unknown users resolve to an adult profile.
    async fn profile(&self, user_id: &str) -> Result<AccountProfile, DirectoryError>;

    async fn upsert(&self, profile: AccountProfile) -> Result<(), DirectoryError>;

    /// Flip the independence flag. Returns `true` if the flag changed.
    async fn set_independent(&self, user_id: &str, independent: bool)
        -> Result<bool, DirectoryError>;

    /// Backend name for stats and logs
    fn name(&self) -> &'static str;
}

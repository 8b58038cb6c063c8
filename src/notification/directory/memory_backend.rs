//! In-memory account directory, populated through the service API.

use async_trait::async_trait;
use dashmap::DashMap;

use super::{AccountDirectory, AccountProfile, DirectoryError};

#[derive(Default)]
pub struct MemoryAccountDirectory {
    profiles: DashMap<String, AccountProfile>,
}

impl MemoryAccountDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[async_trait]
impl AccountDirectory for MemoryAccountDirectory {
    async fn profile(&self, user_id: &str) -> Result<AccountProfile, DirectoryError> {
        Ok(self
            .profiles
            .get(user_id)
            .map(|p| p.clone())
            .unwrap_or_else(|| AccountProfile::adult(user_id)))
    }

    async fn upsert(&self, profile: AccountProfile) -> Result<(), DirectoryError> {
        self.profiles.insert(profile.user_id.clone(), profile);
        Ok(())
    }

    async fn set_independent(
        &self,
        user_id: &str,
        independent: bool,
    ) -> Result<bool, DirectoryError> {
        let mut entry = self
            .profiles
            .get_mut(user_id)
            .ok_or_else(|| DirectoryError::NotFound(user_id.to_string()))?;
        if entry.independent == independent {
            return Ok(false);
        }
        entry.independent = independent;
        Ok(true)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_user_is_adult() {
        let dir = MemoryAccountDirectory::new();
        let profile = dir.profile("nobody").await.unwrap();
        assert!(!profile.is_minor);
        assert!(!profile.is_gated());
    }

    #[tokio::test]
    async fn test_set_independent_reports_change_once() {
        let dir = MemoryAccountDirectory::new();
        dir.upsert(AccountProfile::minor("kid-1", "parent-1"))
            .await
            .unwrap();

        assert!(dir.profile("kid-1").await.unwrap().is_gated());
        assert!(dir.set_independent("kid-1", true).await.unwrap());
        assert!(!dir.set_independent("kid-1", true).await.unwrap());
        assert!(!dir.profile("kid-1").await.unwrap().is_gated());
    }

    #[tokio::test]
    async fn test_set_independent_unknown_user() {
        let dir = MemoryAccountDirectory::new();
        let err = dir.set_independent("ghost", true).await.unwrap_err();
        assert!(matches!(err, DirectoryError::NotFound(_)));
    }
}

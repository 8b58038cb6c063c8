//! Independence profile storage.
//!
//! Profiles run for months against a stored target date, so they live
//! beside approvals: DashMap for tests and single-node runs, the
//! `independence_profiles` table otherwise.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::Row;
use thiserror::Error;

use crate::postgres::{PostgresPool, PostgresPoolError};

use super::independence::IndependenceProfile;

#[derive(Debug, Error)]
pub enum IndependenceStoreError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for IndependenceStoreError {
    fn from(err: serde_json::Error) -> Self {
        IndependenceStoreError::Serialization(err.to_string())
    }
}

impl From<PostgresPoolError> for IndependenceStoreError {
    fn from(err: PostgresPoolError) -> Self {
        IndependenceStoreError::Storage(err.to_string())
    }
}

#[async_trait]
pub trait IndependenceStore: Send + Sync {
    async fn get(&self, kid_id: &str) -> Result<Option<IndependenceProfile>, IndependenceStoreError>;

    /// Insert or replace. A write carrying an older revision than the
    /// stored one is ignored.
    async fn save(&self, profile: &IndependenceProfile) -> Result<(), IndependenceStoreError>;

    /// Profiles the evaluator looks at: unpinned ones, plus any that still
    /// owe their phase-change notices.
    async fn due(&self) -> Result<Vec<IndependenceProfile>, IndependenceStoreError>;

    async fn count(&self) -> Result<usize, IndependenceStoreError>;

    fn name(&self) -> &'static str;
}

#[derive(Default)]
pub struct MemoryIndependenceStore {
    profiles: DashMap<String, IndependenceProfile>,
}

impl MemoryIndependenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IndependenceStore for MemoryIndependenceStore {
    async fn get(&self, kid_id: &str) -> Result<Option<IndependenceProfile>, IndependenceStoreError> {
        Ok(self.profiles.get(kid_id).map(|p| p.clone()))
    }

    async fn save(&self, profile: &IndependenceProfile) -> Result<(), IndependenceStoreError> {
        let mut slot = self
            .profiles
            .entry(profile.kid_id.clone())
            .or_insert_with(|| profile.clone());
        if slot.revision <= profile.revision {
            *slot = profile.clone();
        }
        Ok(())
    }

    async fn due(&self) -> Result<Vec<IndependenceProfile>, IndependenceStoreError> {
        Ok(self
            .profiles
            .iter()
            .filter(|p| !p.pinned || p.notice_pending)
            .map(|p| p.clone())
            .collect())
    }

    async fn count(&self) -> Result<usize, IndependenceStoreError> {
        Ok(self.profiles.len())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// PostgreSQL store over `independence_profiles`. Phase, pin and the
/// pending-notice flag are columns for the evaluator's query; the profile
/// itself is JSONB.
pub struct PostgresIndependenceStore {
    pool: Arc<PostgresPool>,
}

impl PostgresIndependenceStore {
    pub fn new(pool: Arc<PostgresPool>) -> Self {
        Self { pool }
    }

    fn decode_row(row: &sqlx::postgres::PgRow) -> Result<IndependenceProfile, IndependenceStoreError> {
        let body: serde_json::Value = row.try_get("body").map_err(storage)?;
        let mut profile: IndependenceProfile = serde_json::from_value(body)?;
        profile.pinned = row.try_get("pinned").map_err(storage)?;
        profile.notice_pending = row.try_get("notice_pending").map_err(storage)?;
        Ok(profile)
    }
}

fn storage(err: sqlx::Error) -> IndependenceStoreError {
    IndependenceStoreError::Storage(err.to_string())
}

const SELECT_COLUMNS: &str = "SELECT body, pinned, notice_pending FROM independence_profiles";

#[async_trait]
impl IndependenceStore for PostgresIndependenceStore {
    async fn get(&self, kid_id: &str) -> Result<Option<IndependenceProfile>, IndependenceStoreError> {
        let row = self
            .pool
            .execute_with_circuit_breaker(|pool| async move {
                sqlx::query(&format!("{} WHERE kid_id = $1", SELECT_COLUMNS))
                    .bind(kid_id)
                    .fetch_optional(&pool)
                    .await
            })
            .await?;

        row.as_ref().map(Self::decode_row).transpose()
    }

    async fn save(&self, profile: &IndependenceProfile) -> Result<(), IndependenceStoreError> {
        let body = serde_json::to_value(profile)?;

        self.pool
            .execute_with_circuit_breaker(|pool| async move {
                sqlx::query(
                    r#"
                    INSERT INTO independence_profiles
                        (kid_id, phase, pinned, notice_pending, revision, updated_at, body)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    ON CONFLICT (kid_id) DO UPDATE SET
                        phase = EXCLUDED.phase,
                        pinned = EXCLUDED.pinned,
                        notice_pending = EXCLUDED.notice_pending,
                        revision = EXCLUDED.revision,
                        updated_at = EXCLUDED.updated_at,
                        body = EXCLUDED.body
                    WHERE independence_profiles.revision <= EXCLUDED.revision
                    "#,
                )
                .bind(&profile.kid_id)
                .bind(profile.phase.as_str())
                .bind(profile.pinned)
                .bind(profile.notice_pending)
                .bind(profile.revision as i64)
                .bind(profile.updated_at)
                .bind(&body)
                .execute(&pool)
                .await
            })
            .await?;

        Ok(())
    }

    async fn due(&self) -> Result<Vec<IndependenceProfile>, IndependenceStoreError> {
        let rows = self
            .pool
            .execute_with_circuit_breaker(|pool| async move {
                sqlx::query(&format!(
                    "{} WHERE NOT pinned OR notice_pending ORDER BY kid_id",
                    SELECT_COLUMNS
                ))
                .fetch_all(&pool)
                .await
            })
            .await?;

        rows.iter().map(Self::decode_row).collect()
    }

    async fn count(&self) -> Result<usize, IndependenceStoreError> {
        let count: i64 = self
            .pool
            .execute_with_circuit_breaker(|pool| async move {
                sqlx::query_scalar("SELECT COUNT(*) FROM independence_profiles")
                    .fetch_one(&pool)
                    .await
            })
            .await?;

        Ok(count.max(0) as usize)
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{Duration, Utc};

    use super::*;
    use crate::notification::IndependencePhase;

    fn profile(kid_id: &str) -> IndependenceProfile {
        let now = Utc::now();
        IndependenceProfile {
            kid_id: kid_id.into(),
            guardian_id: Some("parent-1".into()),
            target_date: now + Duration::days(60),
            maturity_score: 0.5,
            requirements: BTreeMap::new(),
            phase: IndependencePhase::Monitoring,
            transition_started_at: None,
            pinned: false,
            notice_pending: false,
            revision: 0,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_stale_revision_does_not_overwrite() {
        let store = MemoryIndependenceStore::new();
        let mut current = profile("kid-1");
        current.phase = IndependencePhase::Warning;
        current.revision = 2;
        store.save(&current).await.unwrap();

        let stale = profile("kid-1");
        store.save(&stale).await.unwrap();

        let stored = store.get("kid-1").await.unwrap().unwrap();
        assert_eq!(stored.phase, IndependencePhase::Warning);
        assert_eq!(stored.revision, 2);
    }

    #[tokio::test]
    async fn test_due_skips_pinned_unless_notice_pending() {
        let store = MemoryIndependenceStore::new();
        store.save(&profile("open")).await.unwrap();

        let mut pinned = profile("pinned");
        pinned.pinned = true;
        store.save(&pinned).await.unwrap();

        let mut owed = profile("owed");
        owed.pinned = true;
        owed.notice_pending = true;
        store.save(&owed).await.unwrap();

        let mut due: Vec<String> = store.due().await.unwrap().into_iter().map(|p| p.kid_id).collect();
        due.sort();
        assert_eq!(due, vec!["open".to_string(), "owed".to_string()]);
        assert_eq!(store.count().await.unwrap(), 3);
    }

    /// Needs a reachable database in `HAVEN_TEST_DATABASE_URL`.
    #[tokio::test]
    #[ignore]
    async fn test_postgres_round_trip_keeps_pending_notice() {
        use crate::config::DatabaseConfig;
        use crate::resilience::CircuitBreaker;

        let config = DatabaseConfig {
            url: std::env::var("HAVEN_TEST_DATABASE_URL").ok(),
            ..DatabaseConfig::default()
        };
        let pool = PostgresPool::new(&config, Arc::new(CircuitBreaker::new("postgres")))
            .await
            .expect("HAVEN_TEST_DATABASE_URL must point at a test database");
        pool.ensure_schema().await.unwrap();
        let store = PostgresIndependenceStore::new(Arc::new(pool));

        let mut saved = profile(&format!("kid-{}", uuid::Uuid::new_v4()));
        saved.phase = IndependencePhase::Warning;
        saved.revision = 1;
        saved.notice_pending = true;
        store.save(&saved).await.unwrap();
        store.save(&profile(&saved.kid_id)).await.unwrap();

        let loaded = store.get(&saved.kid_id).await.unwrap().unwrap();
        assert_eq!(loaded.phase, IndependencePhase::Warning);
        assert!(loaded.notice_pending);
        assert!(store.due().await.unwrap().iter().any(|p| p.kid_id == saved.kid_id));
    }
}

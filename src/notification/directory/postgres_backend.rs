//! PostgreSQL account directory over `account_profiles`.
//!
//! Profiles survive restarts, so a minor registered once stays gated.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::Row;

use crate::postgres::PostgresPool;

use super::{AccountDirectory, AccountProfile, DirectoryError};

pub struct PostgresAccountDirectory {
    pool: Arc<PostgresPool>,
}

impl PostgresAccountDirectory {
    pub fn new(pool: Arc<PostgresPool>) -> Self {
        Self { pool }
    }

    fn decode_row(row: &sqlx::postgres::PgRow) -> Result<AccountProfile, DirectoryError> {
        Ok(AccountProfile {
            user_id: row.try_get("user_id").map_err(unavailable)?,
            is_minor: row.try_get("is_minor").map_err(unavailable)?,
            guardian_id: row.try_get("guardian_id").map_err(unavailable)?,
            independent: row.try_get("independent").map_err(unavailable)?,
            display_name: row.try_get("display_name").map_err(unavailable)?,
        })
    }
}

fn unavailable(err: sqlx::Error) -> DirectoryError {
    DirectoryError::Unavailable(err.to_string())
}

#[async_trait]
impl AccountDirectory for PostgresAccountDirectory {
    async fn profile(&self, user_id: &str) -> Result<AccountProfile, DirectoryError> {
        let row = self
            .pool
            .execute_with_circuit_breaker(|pool| async move {
                sqlx::query(
                    r#"
                    SELECT user_id, is_minor, guardian_id, independent, display_name
                    FROM account_profiles WHERE user_id = $1
                    "#,
                )
                .bind(user_id)
                .fetch_optional(&pool)
                .await
            })
            .await?;

        match row {
            Some(row) => Self::decode_row(&row),
            None => Ok(AccountProfile::adult(user_id)),
        }
    }

    async fn upsert(&self, profile: AccountProfile) -> Result<(), DirectoryError> {
        let profile = &profile;
        self.pool
            .execute_with_circuit_breaker(|pool| async move {
                sqlx::query(
                    r#"
                    INSERT INTO account_profiles
                        (user_id, is_minor, guardian_id, independent, display_name, updated_at)
                    VALUES ($1, $2, $3, $4, $5, NOW())
                    ON CONFLICT (user_id) DO UPDATE SET
                        is_minor = EXCLUDED.is_minor,
                        guardian_id = EXCLUDED.guardian_id,
                        independent = EXCLUDED.independent,
                        display_name = EXCLUDED.display_name,
                        updated_at = NOW()
                    "#,
                )
                .bind(&profile.user_id)
                .bind(profile.is_minor)
                .bind(&profile.guardian_id)
                .bind(profile.independent)
                .bind(&profile.display_name)
                .execute(&pool)
                .await
            })
            .await?;

        tracing::debug!(
            user_id = %profile.user_id,
            is_minor = profile.is_minor,
            "Account profile stored in PostgreSQL"
        );
        Ok(())
    }

    async fn set_independent(
        &self,
        user_id: &str,
        independent: bool,
    ) -> Result<bool, DirectoryError> {
        // `found` tells an unchanged flag apart from a missing account
        let row = self
            .pool
            .execute_with_circuit_breaker(|pool| async move {
                sqlx::query(
                    r#"
                    WITH target AS (
                        SELECT user_id, independent FROM account_profiles WHERE user_id = $1
                    ), updated AS (
                        UPDATE account_profiles SET independent = $2, updated_at = NOW()
                        WHERE user_id = $1 AND independent <> $2
                        RETURNING user_id
                    )
                    SELECT
                        EXISTS (SELECT 1 FROM target) AS found,
                        EXISTS (SELECT 1 FROM updated) AS changed
                    "#,
                )
                .bind(user_id)
                .bind(independent)
                .fetch_one(&pool)
                .await
            })
            .await?;

        let found: bool = row.try_get("found").map_err(unavailable)?;
        if !found {
            return Err(DirectoryError::NotFound(user_id.to_string()));
        }
        row.try_get("changed").map_err(unavailable)
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}

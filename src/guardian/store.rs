//! Approval record storage.
//!
//! Every status change is a compare-and-set from `pending`, so concurrent
//! guardian actions and the expiry sweep resolve a record exactly once.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sqlx::Row;
use uuid::Uuid;

use crate::notification::ApprovalStatus;
use crate::postgres::PostgresPool;

use super::approval::{ApprovalError, ApprovalRecord, Resolution};

#[async_trait]
pub trait ApprovalStore: Send + Sync {
    /// Insert a new record. Returns `false` if the id already exists; the
    /// stored record is left as is.
    async fn insert(&self, record: &ApprovalRecord) -> Result<bool, ApprovalError>;

    async fn get(&self, id: Uuid) -> Result<Option<ApprovalRecord>, ApprovalError>;

    /// Move a pending record to a terminal status. `None` when the record
    /// was no longer pending.
    async fn resolve(&self, id: Uuid, resolution: &Resolution) -> Result<Option<ApprovalRecord>, ApprovalError>;

    /// Flag the terminal effect as sent. `false` if it already was.
    async fn mark_outcome_emitted(&self, id: Uuid) -> Result<bool, ApprovalError>;

    /// Overdue pending records plus terminal records whose effect is
    /// still outstanding.
    async fn unsettled(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ApprovalRecord>, ApprovalError>;

    /// Pending records awaiting a guardian, oldest first.
    async fn pending_for_guardian(&self, guardian_id: &str) -> Result<Vec<ApprovalRecord>, ApprovalError>;

    fn name(&self) -> &'static str;
}

pub struct MemoryApprovalStore {
    records: DashMap<Uuid, ApprovalRecord>,
}

impl MemoryApprovalStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for MemoryApprovalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ApprovalStore for MemoryApprovalStore {
    async fn insert(&self, record: &ApprovalRecord) -> Result<bool, ApprovalError> {
        match self.records.entry(record.id()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(true)
            }
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<ApprovalRecord>, ApprovalError> {
        Ok(self.records.get(&id).map(|r| r.clone()))
    }

    async fn resolve(&self, id: Uuid, resolution: &Resolution) -> Result<Option<ApprovalRecord>, ApprovalError> {
        let mut record = self.records.get_mut(&id).ok_or(ApprovalError::NotFound(id))?;
        if !record.status.can_transition_to(resolution.status) {
            return Ok(None);
        }
        *record = record.resolved(resolution);
        Ok(Some(record.clone()))
    }

    async fn mark_outcome_emitted(&self, id: Uuid) -> Result<bool, ApprovalError> {
        let mut record = self.records.get_mut(&id).ok_or(ApprovalError::NotFound(id))?;
        if record.outcome_emitted {
            return Ok(false);
        }
        record.outcome_emitted = true;
        Ok(true)
    }

    async fn unsettled(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ApprovalRecord>, ApprovalError> {
        let mut records: Vec<ApprovalRecord> = self
            .records
            .iter()
            .filter(|r| r.is_overdue(now) || r.needs_settlement())
            .map(|r| r.clone())
            .collect();
        records.sort_by_key(|r| r.expires_at);
        records.truncate(limit);
        Ok(records)
    }

    async fn pending_for_guardian(&self, guardian_id: &str) -> Result<Vec<ApprovalRecord>, ApprovalError> {
        let mut records: Vec<ApprovalRecord> = self
            .records
            .iter()
            .filter(|r| r.status == ApprovalStatus::Pending && r.request.guardian_id == guardian_id)
            .map(|r| r.clone())
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// PostgreSQL approval store over `guardian_approvals`. Status and the
/// emitted flag are columns so the compare-and-sets happen in SQL; the
/// rest of the record is JSONB.
pub struct PostgresApprovalStore {
    pool: Arc<PostgresPool>,
}

impl PostgresApprovalStore {
    pub fn new(pool: Arc<PostgresPool>) -> Self {
        Self { pool }
    }

    fn decode_row(row: &sqlx::postgres::PgRow) -> Result<ApprovalRecord, ApprovalError> {
        let body: serde_json::Value = row.try_get("body").map_err(storage)?;
        let mut record: ApprovalRecord = serde_json::from_value(body)?;
        let status: String = row.try_get("status").map_err(storage)?;
        record.status = ApprovalStatus::parse(&status)
            .ok_or_else(|| ApprovalError::Serialization(format!("unknown status '{}'", status)))?;
        record.outcome_emitted = row.try_get("outcome_emitted").map_err(storage)?;
        Ok(record)
    }
}

fn storage(err: sqlx::Error) -> ApprovalError {
    ApprovalError::Storage(err.to_string())
}

const SELECT_COLUMNS: &str = "SELECT body, status, outcome_emitted FROM guardian_approvals";

#[async_trait]
impl ApprovalStore for PostgresApprovalStore {
    async fn insert(&self, record: &ApprovalRecord) -> Result<bool, ApprovalError> {
        let body = serde_json::to_value(record)?;

        let result = self
            .pool
            .execute_with_circuit_breaker(|pool| async move {
                sqlx::query(
                    r#"
                    INSERT INTO guardian_approvals
                        (id, guardian_id, kid_account_id, request_type, status, expires_at, outcome_emitted, body)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    ON CONFLICT (id) DO NOTHING
                    "#,
                )
                .bind(record.id())
                .bind(&record.request.guardian_id)
                .bind(&record.request.kid_account_id)
                .bind(record.request.request_type.as_str())
                .bind(record.status.as_str())
                .bind(record.expires_at)
                .bind(record.outcome_emitted)
                .bind(&body)
                .execute(&pool)
                .await
            })
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, id: Uuid) -> Result<Option<ApprovalRecord>, ApprovalError> {
        let row = self
            .pool
            .execute_with_circuit_breaker(|pool| async move {
                sqlx::query(&format!("{} WHERE id = $1", SELECT_COLUMNS))
                    .bind(id)
                    .fetch_optional(&pool)
                    .await
            })
            .await?;

        row.as_ref().map(Self::decode_row).transpose()
    }

    async fn resolve(&self, id: Uuid, resolution: &Resolution) -> Result<Option<ApprovalRecord>, ApprovalError> {
        let current = self.get(id).await?.ok_or(ApprovalError::NotFound(id))?;
        if !current.status.can_transition_to(resolution.status) {
            return Ok(None);
        }
        let updated = current.resolved(resolution);
        let body = serde_json::to_value(&updated)?;
        let status = updated.status.as_str();

        let result = self
            .pool
            .execute_with_circuit_breaker(|pool| async move {
                sqlx::query(
                    r#"
                    UPDATE guardian_approvals SET status = $2, body = $3
                    WHERE id = $1 AND status = 'pending'
                    "#,
                )
                .bind(id)
                .bind(status)
                .bind(&body)
                .execute(&pool)
                .await
            })
            .await?;

        Ok((result.rows_affected() > 0).then_some(updated))
    }

    async fn mark_outcome_emitted(&self, id: Uuid) -> Result<bool, ApprovalError> {
        let result = self
            .pool
            .execute_with_circuit_breaker(|pool| async move {
                sqlx::query(
                    r#"
                    UPDATE guardian_approvals
                    SET outcome_emitted = TRUE, body = jsonb_set(body, '{outcome_emitted}', 'true'::jsonb)
                    WHERE id = $1 AND NOT outcome_emitted
                    "#,
                )
                .bind(id)
                .execute(&pool)
                .await
            })
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn unsettled(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ApprovalRecord>, ApprovalError> {
        let rows = self
            .pool
            .execute_with_circuit_breaker(|pool| async move {
                sqlx::query(&format!(
                    r#"{}
                    WHERE (status = 'pending' AND expires_at <= $1)
                       OR (status <> 'pending' AND NOT outcome_emitted)
                    ORDER BY expires_at ASC
                    LIMIT $2"#,
                    SELECT_COLUMNS
                ))
                .bind(now)
                .bind(limit as i64)
                .fetch_all(&pool)
                .await
            })
            .await?;

        rows.iter().map(Self::decode_row).collect()
    }

    async fn pending_for_guardian(&self, guardian_id: &str) -> Result<Vec<ApprovalRecord>, ApprovalError> {
        let rows = self
            .pool
            .execute_with_circuit_breaker(|pool| async move {
                sqlx::query(&format!(
                    "{} WHERE guardian_id = $1 AND status = 'pending' ORDER BY expires_at ASC",
                    SELECT_COLUMNS
                ))
                .bind(guardian_id)
                .fetch_all(&pool)
                .await
            })
            .await?;

        rows.iter().map(Self::decode_row).collect()
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}

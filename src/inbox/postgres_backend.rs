//! PostgreSQL inbox backend.
//!
//! Each notification is one row in `inbox_notifications`. The full
//! notification is kept as JSONB in `body`; delivery and read state live in
//! their own columns and take precedence over the body when loading.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use crate::notification::{ApprovalStatus, Channel, Notification};
use crate::postgres::PostgresPool;

use super::backend::{InboxBackend, InboxError, InboxStats, RetentionPolicy};

pub struct PostgresInboxBackend {
    pool: Arc<PostgresPool>,
}

impl PostgresInboxBackend {
    pub fn new(pool: Arc<PostgresPool>) -> Self {
        Self { pool }
    }

    fn decode_row(row: &sqlx::postgres::PgRow) -> Result<Notification, InboxError> {
        let body: serde_json::Value = row.try_get("body").map_err(storage)?;
        let mut notification: Notification = serde_json::from_value(body)?;
        notification.delivered = row.try_get("delivered").map_err(storage)?;
        notification.is_read = row.try_get("is_read").map_err(storage)?;
        notification.read_at = row.try_get("read_at").map_err(storage)?;
        Ok(notification)
    }
}

fn storage(err: sqlx::Error) -> InboxError {
    InboxError::Storage(err.to_string())
}

#[async_trait]
impl InboxBackend for PostgresInboxBackend {
    async fn insert(&self, notification: &Notification) -> Result<(), InboxError> {
        let body = serde_json::to_value(notification)?;
        let channels = notification.channels.names();

        let result = self
            .pool
            .execute_with_circuit_breaker(|pool| async move {
                sqlx::query(
                    r#"
                    INSERT INTO inbox_notifications
                        (id, recipient_id, notification_type, channels, delivered, is_read, read_at, created_at, body)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    ON CONFLICT (id) DO NOTHING
                    "#,
                )
                .bind(notification.id)
                .bind(&notification.recipient_id)
                .bind(notification.notification_type.as_str())
                .bind(&channels)
                .bind(notification.delivered)
                .bind(notification.is_read)
                .bind(notification.read_at)
                .bind(notification.created_at)
                .bind(&body)
                .execute(&pool)
                .await
            })
            .await?;

        if result.rows_affected() == 0 {
            return Err(InboxError::Duplicate(notification.id));
        }

        tracing::trace!(
            notification_id = %notification.id,
            recipient_id = %notification.recipient_id,
            "Notification stored in PostgreSQL inbox"
        );
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Notification>, InboxError> {
        let row = self
            .pool
            .execute_with_circuit_breaker(|pool| async move {
                sqlx::query(
                    "SELECT body, delivered, is_read, read_at FROM inbox_notifications WHERE id = $1",
                )
                .bind(id)
                .fetch_optional(&pool)
                .await
            })
            .await?;

        row.as_ref().map(Self::decode_row).transpose()
    }

    async fn undelivered(&self, user_id: &str, limit: usize) -> Result<Vec<Notification>, InboxError> {
        let rows = self
            .pool
            .execute_with_circuit_breaker(|pool| async move {
                sqlx::query(
                    r#"
                    SELECT body, delivered, is_read, read_at FROM inbox_notifications
                    WHERE recipient_id = $1 AND NOT delivered
                    ORDER BY created_at ASC
                    LIMIT $2
                    "#,
                )
                .bind(user_id)
                .bind(limit as i64)
                .fetch_all(&pool)
                .await
            })
            .await?;

        rows.iter().map(Self::decode_row).collect()
    }

    async fn mark_delivered(&self, user_id: &str, ids: &[Uuid]) -> Result<usize, InboxError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let result = self
            .pool
            .execute_with_circuit_breaker(|pool| async move {
                sqlx::query(
                    r#"
                    UPDATE inbox_notifications SET delivered = TRUE
                    WHERE recipient_id = $1 AND id = ANY($2) AND NOT delivered
                    "#,
                )
                .bind(user_id)
                .bind(ids)
                .execute(&pool)
                .await
            })
            .await?;

        Ok(result.rows_affected() as usize)
    }

    async fn mark_read(&self, user_id: &str, id: Uuid) -> Result<bool, InboxError> {
        let row = self
            .pool
            .execute_with_circuit_breaker(|pool| async move {
                sqlx::query(
                    r#"
                    WITH target AS (
                        SELECT id, is_read FROM inbox_notifications
                        WHERE id = $1 AND recipient_id = $2
                    ),
                    updated AS (
                        UPDATE inbox_notifications SET is_read = TRUE, read_at = NOW()
                        WHERE id IN (SELECT id FROM target WHERE NOT is_read)
                        RETURNING id
                    )
                    SELECT
                        (SELECT COUNT(*) FROM target) AS found,
                        (SELECT COUNT(*) FROM updated) AS changed
                    "#,
                )
                .bind(id)
                .bind(user_id)
                .fetch_one(&pool)
                .await
            })
            .await?;

        let found: i64 = row.try_get("found").map_err(storage)?;
        let changed: i64 = row.try_get("changed").map_err(storage)?;
        if found == 0 {
            return Err(InboxError::NotFound(id));
        }
        Ok(changed > 0)
    }

    async fn mark_all_read(&self, user_id: &str) -> Result<usize, InboxError> {
        let result = self
            .pool
            .execute_with_circuit_breaker(|pool| async move {
                sqlx::query(
                    r#"
                    UPDATE inbox_notifications SET is_read = TRUE, read_at = NOW()
                    WHERE recipient_id = $1 AND NOT is_read
                    "#,
                )
                .bind(user_id)
                .execute(&pool)
                .await
            })
            .await?;

        Ok(result.rows_affected() as usize)
    }

    async fn unread_count(&self, user_id: &str) -> Result<u64, InboxError> {
        let (count,): (i64,) = self
            .pool
            .execute_with_circuit_breaker(|pool| async move {
                sqlx::query_as(
                    "SELECT COUNT(*) FROM inbox_notifications WHERE recipient_id = $1 AND NOT is_read",
                )
                .bind(user_id)
                .fetch_one(&pool)
                .await
            })
            .await?;

        Ok(count.max(0) as u64)
    }

    async fn resolve_guardian_status(&self, id: Uuid, status: ApprovalStatus) -> Result<bool, InboxError> {
        if !status.is_terminal() {
            return Ok(false);
        }

        // Compare-and-set on the body: only a pending guardian row moves.
        let result = self
            .pool
            .execute_with_circuit_breaker(|pool| async move {
                sqlx::query(
                    r#"
                    UPDATE inbox_notifications
                    SET body = jsonb_set(
                        jsonb_set(body, '{status}', to_jsonb($2::text)),
                        '{requires_action}', 'false'::jsonb
                    )
                    WHERE id = $1 AND body->>'kind' = 'guardian' AND body->>'status' = 'pending'
                    "#,
                )
                .bind(id)
                .bind(status.as_str())
                .execute(&pool)
                .await
            })
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn cleanup_expired(&self, retention: &RetentionPolicy, now: DateTime<Utc>) -> Result<usize, InboxError> {
        // A row survives while any of its channels still retains it.
        let result = self
            .pool
            .execute_with_circuit_breaker(|pool| async move {
                sqlx::query(
                    r#"
                    DELETE FROM inbox_notifications
                    WHERE NOT (
                        ('in_app' = ANY(channels) AND created_at > $1)
                        OR ('push' = ANY(channels) AND created_at > $2)
                        OR ('email' = ANY(channels) AND created_at > $3)
                        OR ('sms' = ANY(channels) AND created_at > $4)
                    )
                    "#,
                )
                .bind(now - retention.for_channel(Channel::InApp))
                .bind(now - retention.for_channel(Channel::Push))
                .bind(now - retention.for_channel(Channel::Email))
                .bind(now - retention.for_channel(Channel::Sms))
                .execute(&pool)
                .await
            })
            .await?;

        Ok(result.rows_affected() as usize)
    }

    async fn stats(&self) -> Result<InboxStats, InboxError> {
        let row = self
            .pool
            .execute_with_circuit_breaker(|pool| async move {
                sqlx::query(
                    r#"
                    SELECT
                        COUNT(*) AS total,
                        COUNT(*) FILTER (WHERE NOT delivered) AS undelivered,
                        COUNT(*) FILTER (WHERE NOT is_read) AS unread,
                        COUNT(DISTINCT recipient_id) AS users
                    FROM inbox_notifications
                    "#,
                )
                .fetch_one(&pool)
                .await
            })
            .await?;

        let get = |column: &str| -> Result<usize, InboxError> {
            let value: i64 = row.try_get(column).map_err(storage)?;
            Ok(value.max(0) as usize)
        };

        Ok(InboxStats {
            backend_type: self.name().to_string(),
            total_notifications: get("total")?,
            undelivered: get("undelivered")?,
            unread: get("unread")?,
            users: get("users")?,
        })
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}

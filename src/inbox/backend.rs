//! Backend trait for the offline inbox.
//!
//! Every notification is persisted here before any push is attempted, so a
//! recipient who was offline (or whose socket dropped mid-send) can pull it
//! later. Inserts are atomic on the notification id.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::config::RetentionConfig;
use crate::notification::{ApprovalStatus, Channel, ChannelSet, Notification};
use crate::postgres::PostgresPoolError;

#[derive(Debug, Error)]
pub enum InboxError {
    /// A notification with this id is already stored
    #[error("notification {0} already stored")]
    Duplicate(Uuid),

    #[error("notification {0} not found")]
    NotFound(Uuid),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for InboxError {
    fn from(err: serde_json::Error) -> Self {
        InboxError::Serialization(err.to_string())
    }
}

impl From<PostgresPoolError> for InboxError {
    fn from(err: PostgresPoolError) -> Self {
        InboxError::Storage(err.to_string())
    }
}

/// Retention per delivery channel. A notification lives as long as the
/// longest retention among its channels.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub in_app: Duration,
    pub push: Duration,
    pub email: Duration,
    pub sms: Duration,
}

impl RetentionPolicy {
    pub fn for_channel(&self, channel: Channel) -> Duration {
        match channel {
            Channel::InApp => self.in_app,
            Channel::Push => self.push,
            Channel::Email => self.email,
            Channel::Sms => self.sms,
        }
    }

    pub fn for_channels(&self, channels: ChannelSet) -> Duration {
        channels
            .iter()
            .map(|c| self.for_channel(c))
            .max()
            .unwrap_or(self.in_app)
    }

    pub fn is_expired(&self, notification: &Notification, now: DateTime<Utc>) -> bool {
        notification.created_at + self.for_channels(notification.channels) <= now
    }

    /// Oldest creation time still retained for a channel set.
    pub fn cutoff(&self, channels: ChannelSet, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.for_channels(channels)
    }
}

impl From<&RetentionConfig> for RetentionPolicy {
    fn from(config: &RetentionConfig) -> Self {
        Self {
            in_app: Duration::days(config.in_app_days as i64),
            push: Duration::days(config.push_days as i64),
            email: Duration::days(config.email_days as i64),
            sms: Duration::days(config.sms_days as i64),
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::from(&RetentionConfig::default())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InboxStats {
    pub backend_type: String,
    pub total_notifications: usize,
    pub undelivered: usize,
    pub unread: usize,
    pub users: usize,
}

/// Storage for the per-user notification inbox.
///
/// Implementations must be `Send + Sync`; they are shared by the delivery
/// router, the websocket handlers and the HTTP sync surface.
#[async_trait]
pub trait InboxBackend: Send + Sync {
    /// Store a notification. Returns `InboxError::Duplicate` when the id is
    /// already present; the stored row is left untouched.
    async fn insert(&self, notification: &Notification) -> Result<(), InboxError>;

    async fn get(&self, id: Uuid) -> Result<Option<Notification>, InboxError>;

    /// Undelivered notifications for a user, oldest first.
    async fn undelivered(&self, user_id: &str, limit: usize) -> Result<Vec<Notification>, InboxError>;

    /// Mark notifications delivered. Ids that belong to someone else are
    /// ignored. Returns how many changed.
    async fn mark_delivered(&self, user_id: &str, ids: &[Uuid]) -> Result<usize, InboxError>;

    /// Mark one notification read. Returns `false` if it was already read.
    async fn mark_read(&self, user_id: &str, id: Uuid) -> Result<bool, InboxError>;

    async fn mark_all_read(&self, user_id: &str) -> Result<usize, InboxError>;

    async fn unread_count(&self, user_id: &str) -> Result<u64, InboxError>;

    /// Move a pending guardian notification to a terminal status. Never
    /// re-enters `pending`; returns `false` when nothing changed.
    async fn resolve_guardian_status(&self, id: Uuid, status: ApprovalStatus) -> Result<bool, InboxError>;

    /// Delete notifications past their channel retention.
    async fn cleanup_expired(&self, retention: &RetentionPolicy, now: DateTime<Utc>) -> Result<usize, InboxError>;

    async fn stats(&self) -> Result<InboxStats, InboxError>;

    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retention_takes_longest_channel() {
        let policy = RetentionPolicy::default();
        assert_eq!(policy.for_channels(ChannelSet::in_app_only()), Duration::days(30));
        assert_eq!(
            policy.for_channels(ChannelSet::from_slice(&[Channel::InApp, Channel::Push])),
            Duration::days(30)
        );
        assert_eq!(
            policy.for_channels(ChannelSet::from_slice(&[Channel::Push, Channel::Email])),
            Duration::days(90)
        );
        assert_eq!(
            policy.for_channels(ChannelSet::from_slice(&[Channel::Push])),
            Duration::days(7)
        );
    }

    #[test]
    fn test_duplicate_error_display() {
        let err = InboxError::Duplicate(Uuid::nil());
        assert!(err.to_string().contains("already stored"));
    }
}

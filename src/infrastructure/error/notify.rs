//! Error taxonomy shared by the notification pipeline.
//!
//! Every failure crossing a component boundary is expressed as a
//! [`NotifyError`]. Consumers use [`NotifyError::is_resolved`] to decide
//! whether a record can be committed without further attention.

use thiserror::Error;
use uuid::Uuid;

use crate::broker::{BrokerError, EnvelopeError};
use crate::guardian::{ApprovalError, IndependenceStoreError};
use crate::inbox::InboxError;
use crate::notification::{Channel, DirectoryError, NotificationType};

#[derive(Debug, Error)]
pub enum NotifyError {
    /// Broker stayed unavailable through the whole retry budget
    #[error("broker unavailable after {attempts} attempts: {message}")]
    TransientBroker { attempts: u32, message: String },

    #[error("broker rejected operation: {0}")]
    Broker(#[from] BrokerError),

    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("notification {0} already exists")]
    DuplicateNotification(Uuid),

    #[error("presence push to {user_id} failed: {reason}")]
    PresenceRoutingFailure { user_id: String, reason: String },

    #[error("dispatch via {channel} failed: {reason}")]
    ChannelDispatchFailure { channel: Channel, reason: String },

    #[error("{notification_type} is not permitted for minor account {recipient_id}: {reason}")]
    KidSafetyViolation {
        recipient_id: String,
        notification_type: NotificationType,
        reason: String,
    },

    #[error("approval request {0} has expired")]
    ApprovalExpired(Uuid),

    #[error("envelope rejected: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("inbox error: {0}")]
    Inbox(#[from] InboxError),

    #[error("approval store error: {0}")]
    Approval(#[from] ApprovalError),

    #[error("account directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("independence store error: {0}")]
    Independence(#[from] IndependenceStoreError),
}

impl NotifyError {
    /// Errors that are final for the record that produced them. Retrying the
    /// same envelope would yield the same outcome, so the offset is committed.
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            NotifyError::UnknownEventType(_)
                | NotifyError::DuplicateNotification(_)
                | NotifyError::PresenceRoutingFailure { .. }
                | NotifyError::ChannelDispatchFailure { .. }
                | NotifyError::KidSafetyViolation { .. }
                | NotifyError::ApprovalExpired(_)
                | NotifyError::Envelope(_)
        )
    }

    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            NotifyError::TransientBroker { .. } => "transient_broker",
            NotifyError::Broker(_) => "broker",
            NotifyError::UnknownEventType(_) => "unknown_event_type",
            NotifyError::DuplicateNotification(_) => "duplicate_notification",
            NotifyError::PresenceRoutingFailure { .. } => "presence_routing",
            NotifyError::ChannelDispatchFailure { .. } => "channel_dispatch",
            NotifyError::KidSafetyViolation { .. } => "kid_safety_violation",
            NotifyError::ApprovalExpired(_) => "approval_expired",
            NotifyError::Envelope(_) => "envelope",
            NotifyError::Inbox(_) => "inbox",
            NotifyError::Approval(_) => "approval",
            NotifyError::Directory(_) => "directory",
            NotifyError::Independence(_) => "independence",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolved_classification() {
        assert!(NotifyError::UnknownEventType("x".into()).is_resolved());
        assert!(NotifyError::DuplicateNotification(Uuid::nil()).is_resolved());
        assert!(NotifyError::ApprovalExpired(Uuid::nil()).is_resolved());
        assert!(!NotifyError::TransientBroker {
            attempts: 3,
            message: "down".into()
        }
        .is_resolved());
        assert!(!NotifyError::Inbox(InboxError::Storage("db down".into())).is_resolved());
        assert!(!NotifyError::from(IndependenceStoreError::Storage("db down".into())).is_resolved());
    }

    #[test]
    fn test_kind_labels() {
        let err = NotifyError::KidSafetyViolation {
            recipient_id: "kid-1".into(),
            notification_type: NotificationType::PostLiked,
            reason: "not on allow-list".into(),
        };
        assert_eq!(err.kind(), "kid_safety_violation");
        assert!(err.to_string().contains("post_liked"));
    }
}

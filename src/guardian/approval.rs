use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::broker::EventEnvelope;
use crate::config::GuardianConfig;
use crate::notification::{ApprovalStatus, GuardianRequestType, NotificationDraft};
use crate::postgres::PostgresPoolError;

const APPROVAL_NAMESPACE: Uuid = Uuid::from_u128(0x6a1f_3c52_9e0b_4d7e_8b21_57c4_d2e9_a013);

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("approval {0} not found")]
    NotFound(Uuid),

    #[error("user {user_id} is not the guardian on approval {approval_id}")]
    NotGuardian { approval_id: Uuid, user_id: String },

    #[error("approval {approval_id} already {status}")]
    AlreadyResolved { approval_id: Uuid, status: &'static str },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ApprovalError {
    fn from(err: serde_json::Error) -> Self {
        ApprovalError::Serialization(err.to_string())
    }
}

impl From<PostgresPoolError> for ApprovalError {
    fn from(err: PostgresPoolError) -> Self {
        ApprovalError::Storage(err.to_string())
    }
}

/// What happens to a request nobody acted on before it expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultOutcome {
    Deny,
    Approve,
    Acknowledge,
}

impl DefaultOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DefaultOutcome::Deny => "deny",
            DefaultOutcome::Approve => "approve",
            DefaultOutcome::Acknowledge => "acknowledge",
        }
    }
}

/// Approval window and per-type expiry outcomes.
#[derive(Debug, Clone)]
pub struct ApprovalPolicy {
    pub window: Duration,
    outcomes: HashMap<GuardianRequestType, DefaultOutcome>,
}

impl ApprovalPolicy {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            outcomes: HashMap::new(),
        }
    }

    pub fn with_outcome(mut self, request_type: GuardianRequestType, outcome: DefaultOutcome) -> Self {
        self.outcomes.insert(request_type, outcome);
        self
    }

    /// Deny unless configured otherwise; activity reviews are acknowledged.
    pub fn outcome_for(&self, request_type: GuardianRequestType) -> DefaultOutcome {
        self.outcomes
            .get(&request_type)
            .copied()
            .unwrap_or(match request_type {
                GuardianRequestType::ActivityReview => DefaultOutcome::Acknowledge,
                _ => DefaultOutcome::Deny,
            })
    }
}

impl From<&GuardianConfig> for ApprovalPolicy {
    fn from(config: &GuardianConfig) -> Self {
        let mut policy = Self::new(Duration::hours(config.approval_window_hours as i64));
        for (name, outcome) in &config.default_outcomes {
            match GuardianRequestType::parse(name) {
                Some(request_type) => {
                    policy.outcomes.insert(request_type, *outcome);
                }
                None => tracing::warn!(request_type = %name, "Ignoring default outcome for unknown request type"),
            }
        }
        policy
    }
}

/// A request the kid-safety gate held for a guardian.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub guardian_id: String,
    pub kid_account_id: String,
    /// Who asked; receives the outcome
    pub requester_id: Option<String>,
    pub request_type: GuardianRequestType,
    pub title: String,
    pub message: String,
    /// The held envelope, re-emitted on approval
    pub envelope: EventEnvelope,
}

impl ApprovalRequest {
    pub fn derive_id(
        event_id: Uuid,
        guardian_id: &str,
        kid_account_id: &str,
        request_type: GuardianRequestType,
    ) -> Uuid {
        let name = format!(
            "{}:{}:{}:{}",
            event_id,
            guardian_id,
            kid_account_id,
            request_type.as_str()
        );
        Uuid::new_v5(&APPROVAL_NAMESPACE, name.as_bytes())
    }

    pub fn from_draft(
        envelope: &EventEnvelope,
        draft: &NotificationDraft,
        guardian_id: &str,
        request_type: GuardianRequestType,
    ) -> Self {
        Self {
            id: Self::derive_id(envelope.id, guardian_id, &draft.recipient_id, request_type),
            guardian_id: guardian_id.to_string(),
            kid_account_id: draft.recipient_id.clone(),
            requester_id: draft.sender_id.clone(),
            request_type,
            title: draft.title.clone(),
            message: draft.message.clone(),
            envelope: envelope.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    #[serde(flatten)]
    pub request: ApprovalRequest,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    /// Set when expiry applied a default outcome
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_outcome: Option<DefaultOutcome>,
    /// The terminal effect (re-emit or outcome notice) went out
    #[serde(default)]
    pub outcome_emitted: bool,
}

impl ApprovalRecord {
    pub fn pending(request: ApprovalRequest, now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            request,
            status: ApprovalStatus::Pending,
            created_at: now,
            expires_at: now + window,
            resolved_at: None,
            resolved_by: None,
            applied_outcome: None,
            outcome_emitted: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.request.id
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == ApprovalStatus::Pending && self.expires_at <= now
    }

    pub fn is_granted(&self) -> bool {
        match self.status {
            ApprovalStatus::Approved => true,
            ApprovalStatus::Expired => self.applied_outcome == Some(DefaultOutcome::Approve),
            _ => false,
        }
    }

    /// Whether this record lets `draft` of `envelope` through. Only the
    /// re-emission of the held envelope qualifies, and only for the same
    /// kid, request type and sender.
    pub fn authorizes(&self, envelope: &EventEnvelope, draft: &NotificationDraft) -> bool {
        let held = &self.request.envelope;
        self.is_granted()
            && envelope.headers.approval_id == Some(self.id())
            && envelope.headers.parent_event_id == Some(held.id)
            && envelope.id == held.reemit_with_approval(self.id()).id
            && draft.recipient_id == self.request.kid_account_id
            && draft.notification_type.guardian_request_type() == Some(self.request.request_type)
            && draft.sender_id == self.request.requester_id
    }

    /// Terminal but its effect has not gone out yet.
    pub fn needs_settlement(&self) -> bool {
        self.status.is_terminal() && !self.outcome_emitted
    }

    pub(crate) fn resolved(&self, resolution: &Resolution) -> Self {
        Self {
            status: resolution.status,
            resolved_at: Some(resolution.at),
            resolved_by: resolution.by.clone(),
            applied_outcome: resolution.applied_outcome,
            ..self.clone()
        }
    }
}

/// A compare-and-set from `pending`.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub status: ApprovalStatus,
    pub at: DateTime<Utc>,
    pub by: Option<String>,
    pub applied_outcome: Option<DefaultOutcome>,
}

impl Resolution {
    pub fn by_guardian(status: ApprovalStatus, guardian_id: &str, at: DateTime<Utc>) -> Self {
        Self {
            status,
            at,
            by: Some(guardian_id.to_string()),
            applied_outcome: None,
        }
    }

    pub fn expiry(outcome: DefaultOutcome, at: DateTime<Utc>) -> Self {
        Self {
            status: ApprovalStatus::Expired,
            at,
            by: None,
            applied_outcome: Some(outcome),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::notification::NotificationType;

    fn request() -> ApprovalRequest {
        let envelope = EventEnvelope::new("follow.requested", "t", "kid-1", json!({ "actorId": "friend" }));
        let draft = NotificationDraft::new("kid-1", NotificationType::FollowRequest, "t", "m")
            .from_sender(Some("friend".into()));
        ApprovalRequest::from_draft(&envelope, &draft, "parent-1", GuardianRequestType::FollowRequest)
    }

    #[test]
    fn test_id_is_deterministic() {
        let a = request();
        let b = ApprovalRequest::from_draft(
            &a.envelope,
            &NotificationDraft::new("kid-1", NotificationType::FollowRequest, "t", "m"),
            "parent-1",
            GuardianRequestType::FollowRequest,
        );
        assert_eq!(a.id, b.id);

        let review = ApprovalRequest::derive_id(
            a.envelope.id,
            "parent-1",
            "kid-1",
            GuardianRequestType::ActivityReview,
        );
        assert_ne!(a.id, review);
    }

    #[test]
    fn test_default_outcomes() {
        let policy = ApprovalPolicy::new(Duration::hours(72));
        assert_eq!(policy.outcome_for(GuardianRequestType::FollowRequest), DefaultOutcome::Deny);
        assert_eq!(
            policy.outcome_for(GuardianRequestType::ActivityReview),
            DefaultOutcome::Acknowledge
        );

        let policy = policy.with_outcome(GuardianRequestType::GroupInvitation, DefaultOutcome::Approve);
        assert_eq!(
            policy.outcome_for(GuardianRequestType::GroupInvitation),
            DefaultOutcome::Approve
        );
    }

    #[test]
    fn test_policy_from_config_skips_unknown_types() {
        let mut config = GuardianConfig::default();
        config
            .default_outcomes
            .insert("message_request".into(), DefaultOutcome::Approve);
        config.default_outcomes.insert("bogus".into(), DefaultOutcome::Approve);

        let policy = ApprovalPolicy::from(&config);
        assert_eq!(policy.window, Duration::hours(72));
        assert_eq!(
            policy.outcome_for(GuardianRequestType::MessageRequest),
            DefaultOutcome::Approve
        );
    }

    fn follow_draft(recipient: &str, sender: &str) -> NotificationDraft {
        NotificationDraft::new(recipient, NotificationType::FollowRequest, "t", "m")
            .from_sender(Some(sender.into()))
    }

    #[test]
    fn test_authorization_requires_approval_for_the_kid() {
        let now = Utc::now();
        let record = ApprovalRecord::pending(request(), now, Duration::hours(1));
        let reemitted = record.request.envelope.reemit_with_approval(record.id());
        let draft = follow_draft("kid-1", "friend");
        assert!(!record.authorizes(&reemitted, &draft));

        let approved = record.resolved(&Resolution::by_guardian(ApprovalStatus::Approved, "parent-1", now));
        assert!(approved.authorizes(&reemitted, &draft));
        assert!(!approved.authorizes(&reemitted, &follow_draft("kid-2", "friend")));

        let expired_deny = record.resolved(&Resolution::expiry(DefaultOutcome::Deny, now));
        assert!(!expired_deny.authorizes(&reemitted, &draft));
        let expired_approve = record.resolved(&Resolution::expiry(DefaultOutcome::Approve, now));
        assert!(expired_approve.authorizes(&reemitted, &draft));
    }

    #[test]
    fn test_approval_does_not_carry_over_to_other_envelopes() {
        let now = Utc::now();
        let approved = ApprovalRecord::pending(request(), now, Duration::hours(1))
            .resolved(&Resolution::by_guardian(ApprovalStatus::Approved, "parent-1", now));
        let held = &approved.request.envelope;

        // A fresh envelope that only copies the approval header
        let mut forged = EventEnvelope::new("message.requested", "t", "kid-1", json!({ "actorId": "stranger" }));
        forged.headers.approval_id = Some(approved.id());
        forged.headers.parent_event_id = Some(held.id);
        let message = NotificationDraft::new("kid-1", NotificationType::MessageRequest, "t", "m")
            .from_sender(Some("stranger".into()));
        assert!(!approved.authorizes(&forged, &message));
        assert!(!approved.authorizes(&forged, &follow_draft("kid-1", "friend")));

        // The genuine re-emission, but a different request type or sender
        let reemitted = held.reemit_with_approval(approved.id());
        let message = NotificationDraft::new("kid-1", NotificationType::MessageRequest, "t", "m")
            .from_sender(Some("friend".into()));
        assert!(!approved.authorizes(&reemitted, &message));
        assert!(!approved.authorizes(&reemitted, &follow_draft("kid-1", "stranger")));
        assert!(approved.authorizes(&reemitted, &follow_draft("kid-1", "friend")));
    }

    #[test]
    fn test_overdue_only_while_pending() {
        let now = Utc::now();
        let record = ApprovalRecord::pending(request(), now - Duration::hours(2), Duration::hours(1));
        assert!(record.is_overdue(now));

        let resolved = record.resolved(&Resolution::expiry(DefaultOutcome::Deny, now));
        assert!(!resolved.is_overdue(now));
        assert!(resolved.needs_settlement());
    }

    #[test]
    fn test_record_serializes_flat() {
        let record = ApprovalRecord::pending(request(), Utc::now(), Duration::hours(72));
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["status"], "pending");
        assert_eq!(value["request_type"], "follow_request");
        let back: ApprovalRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }
}

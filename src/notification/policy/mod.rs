//! Notification policy engine.
//!
//! Turns an [`EventEnvelope`] into typed [`Notification`]s:
//! registry lookup, builder, kid-safety gate, then priority and channel
//! defaults. Guardian approvals the gate asks for are returned alongside,
//! for the caller to open.

mod builders;
mod gate;
mod registry;

use std::sync::Arc;

use chrono::Utc;
use tracing::instrument;

use crate::broker::EventEnvelope;
use crate::error::NotifyError;
use crate::guardian::{ApprovalRecord, ApprovalRequest, ApprovalStore};
use crate::metrics::PolicyMetrics;

use super::{AccountDirectory, AccountProfile, Notification};

pub use gate::{GateDecision, KidSafetyGate, SafetyViolation, ViolationReason};
pub use registry::{BuildContext, BuilderFn, BuilderRegistry, Drafts, NotificationDraft};

/// Everything the engine decided for one envelope.
#[derive(Debug, Default)]
pub struct PolicyOutcome {
    pub notifications: Vec<Notification>,
    pub approvals: Vec<ApprovalRequest>,
    pub violations: Vec<SafetyViolation>,
}

impl PolicyOutcome {
    pub fn is_empty(&self) -> bool {
        self.notifications.is_empty() && self.approvals.is_empty() && self.violations.is_empty()
    }
}

pub struct PolicyEngine {
    registry: BuilderRegistry,
    directory: Arc<dyn AccountDirectory>,
    approvals: Arc<dyn ApprovalStore>,
    gate: KidSafetyGate,
}

impl PolicyEngine {
    pub fn new(
        registry: BuilderRegistry,
        directory: Arc<dyn AccountDirectory>,
        approvals: Arc<dyn ApprovalStore>,
        gate: KidSafetyGate,
    ) -> Self {
        Self {
            registry,
            directory,
            approvals,
            gate,
        }
    }

    pub fn registry(&self) -> &BuilderRegistry {
        &self.registry
    }

    pub fn directory(&self) -> &Arc<dyn AccountDirectory> {
        &self.directory
    }

    #[instrument(
        skip(self, envelope),
        fields(event_id = %envelope.id, event_type = %envelope.event_type)
    )]
    pub async fn evaluate(&self, envelope: &EventEnvelope) -> Result<PolicyOutcome, NotifyError> {
        let Some(builder) = self.registry.get(&envelope.event_type) else {
            PolicyMetrics::record_unknown_event();
            return Err(NotifyError::UnknownEventType(envelope.event_type.clone()));
        };

        let subject = self.directory.profile(&envelope.subject_user_id).await?;
        let drafts = builder(envelope, &BuildContext { subject: &subject })?;

        self.apply_with_subject(envelope, drafts, Some(subject)).await
    }

    /// Gate and materialize drafts produced outside the registry, such as
    /// chat messages and guardian outcomes.
    pub async fn apply(
        &self,
        envelope: &EventEnvelope,
        drafts: impl IntoIterator<Item = NotificationDraft>,
    ) -> Result<PolicyOutcome, NotifyError> {
        self.apply_with_subject(envelope, drafts, None).await
    }

    async fn apply_with_subject(
        &self,
        envelope: &EventEnvelope,
        drafts: impl IntoIterator<Item = NotificationDraft>,
        subject: Option<AccountProfile>,
    ) -> Result<PolicyOutcome, NotifyError> {
        let mut outcome = PolicyOutcome::default();
        let approval = self.carried_approval(envelope).await?;

        for draft in drafts {
            let recipient = match &subject {
                Some(profile) if profile.user_id == draft.recipient_id => profile.clone(),
                _ => self.directory.profile(&draft.recipient_id).await?,
            };
            let approved = match &approval {
                Some(record) if draft.notification_type.guardian_request_type().is_some() => {
                    let authorized = record.authorizes(envelope, &draft);
                    if !authorized {
                        tracing::warn!(
                            approval_id = %record.id(),
                            recipient_id = %draft.recipient_id,
                            notification_type = %draft.notification_type,
                            "Envelope carries an approval that does not cover this request"
                        );
                    }
                    authorized
                }
                _ => false,
            };

            match self.gate.check(envelope, draft, &recipient, approved) {
                GateDecision::Deliver { draft, mirror } => {
                    outcome.notifications.push(materialize(draft, envelope));
                    outcome.approvals.extend(mirror);
                }
                GateDecision::Intercept(request) => {
                    tracing::info!(
                        kid_account_id = %request.kid_account_id,
                        request_type = request.request_type.as_str(),
                        "Request held for guardian approval"
                    );
                    outcome.approvals.push(request);
                }
                GateDecision::Block { violation, alert } => {
                    PolicyMetrics::record_violation(violation.reason.as_str());
                    tracing::warn!(
                        recipient_id = %violation.recipient_id,
                        notification_type = %violation.notification_type,
                        reason = violation.reason.as_str(),
                        "Notification withheld from minor"
                    );
                    if let Some(alert) = alert {
                        outcome.notifications.push(materialize(alert, envelope));
                    }
                    outcome.violations.push(violation);
                }
            }
        }

        for notification in &outcome.notifications {
            PolicyMetrics::record_notification(notification.notification_type.as_str());
        }

        Ok(outcome)
    }

    /// The approval record named by the envelope, if any. Whether it covers
    /// a given draft is decided per draft by [`ApprovalRecord::authorizes`].
    async fn carried_approval(&self, envelope: &EventEnvelope) -> Result<Option<ApprovalRecord>, NotifyError> {
        let Some(approval_id) = envelope.headers.approval_id else {
            return Ok(None);
        };
        let record = self.approvals.get(approval_id).await?;
        if record.is_none() {
            tracing::warn!(approval_id = %approval_id, "Envelope carries an unknown approval");
        }
        Ok(record)
    }
}

/// Resolve defaults and assign the deterministic id.
///
/// Priority: draft, then envelope header, then type default.
/// Channels: draft, then header, then type default, then priority default.
pub fn materialize(draft: NotificationDraft, envelope: &EventEnvelope) -> Notification {
    let notification_type = draft.notification_type;
    let priority = draft
        .priority
        .or(envelope.headers.priority)
        .unwrap_or_else(|| notification_type.default_priority());
    let channels = draft
        .channels
        .or(envelope.headers.channels)
        .or_else(|| notification_type.default_channels())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| priority.default_channels());

    let mut metadata = draft.metadata;
    metadata.insert("eventType".to_string(), envelope.event_type.clone().into());
    if let Some(correlation_id) = &envelope.headers.correlation_id {
        metadata.insert("correlationId".to_string(), correlation_id.clone().into());
    }

    Notification {
        id: Notification::derive_id(envelope.id, &draft.recipient_id, notification_type),
        notification_type,
        recipient_id: draft.recipient_id,
        sender_id: draft.sender_id,
        title: draft.title,
        message: draft.message,
        created_at: Utc::now(),
        read_at: None,
        is_read: false,
        delivered: false,
        priority,
        channels,
        metadata,
        source_event_id: envelope.id,
        kind: draft.kind,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::guardian::{MemoryApprovalStore, Resolution};
    use crate::notification::ApprovalStatus;
    use crate::notification::{
        Channel, ChannelSet, MemoryAccountDirectory, NotificationKind, NotificationType, Priority,
        KID_ALLOWED_TYPES,
    };

    async fn engine() -> (PolicyEngine, Arc<MemoryAccountDirectory>) {
        let (engine, directory, _) = engine_with_store().await;
        (engine, directory)
    }

    async fn engine_with_store() -> (PolicyEngine, Arc<MemoryAccountDirectory>, Arc<MemoryApprovalStore>) {
        let directory = Arc::new(MemoryAccountDirectory::new());
        directory
            .upsert(AccountProfile::minor("kid-1", "parent-1"))
            .await
            .unwrap();
        let approvals = Arc::new(MemoryApprovalStore::new());
        let engine = PolicyEngine::new(
            BuilderRegistry::with_defaults(),
            directory.clone(),
            approvals.clone(),
            KidSafetyGate::new(
                0.8,
                [
                    NotificationType::DirectMessage,
                    NotificationType::CommentOnOwnPost,
                ],
            ),
        );
        (engine, directory, approvals)
    }

    async fn approve(
        engine: &PolicyEngine,
        approvals: &MemoryApprovalStore,
        envelope: &EventEnvelope,
    ) -> ApprovalRecord {
        let outcome = engine.evaluate(envelope).await.unwrap();
        let request = outcome.approvals.into_iter().next().unwrap();
        let now = Utc::now();
        approvals
            .insert(&ApprovalRecord::pending(request.clone(), now, chrono::Duration::hours(72)))
            .await
            .unwrap();
        approvals
            .resolve(
                request.id,
                &Resolution::by_guardian(ApprovalStatus::Approved, "parent-1", now),
            )
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_unknown_event_type_is_rejected() {
        let (engine, _) = engine().await;
        let envelope = EventEnvelope::new("bogus.event", "t", "u1", json!({}));
        let err = engine.evaluate(&envelope).await.unwrap_err();
        assert!(matches!(err, NotifyError::UnknownEventType(_)));
        assert!(err.is_resolved());
    }

    #[tokio::test]
    async fn test_adult_defaults_follow_priority() {
        let (engine, _) = engine().await;
        let envelope = EventEnvelope::new(
            "post.liked",
            "t",
            "adult-1",
            json!({ "postId": "p1", "actorId": "a2" }),
        )
        .with_priority(Priority::High);

        let outcome = engine.evaluate(&envelope).await.unwrap();
        let notification = &outcome.notifications[0];
        assert_eq!(notification.priority, Priority::High);
        assert!(notification.channels.contains(Channel::Email));
        assert!(!notification.channels.contains(Channel::Sms));
        assert_eq!(
            notification.id,
            Notification::derive_id(envelope.id, "adult-1", NotificationType::PostLiked)
        );
    }

    #[tokio::test]
    async fn test_type_defaults_apply_without_header() {
        let (engine, _) = engine().await;
        let envelope = EventEnvelope::new(
            "repost.created",
            "t",
            "adult-1",
            json!({ "postId": "p1", "repostId": "r1", "actorId": "a2" }),
        );

        let outcome = engine.evaluate(&envelope).await.unwrap();
        let notification = &outcome.notifications[0];
        assert_eq!(notification.priority, Priority::Medium);
        assert_eq!(
            notification.channels,
            ChannelSet::from_slice(&[Channel::InApp, Channel::Push])
        );
    }

    #[tokio::test]
    async fn test_minor_comment_is_kid_in_app_low() {
        let (engine, _) = engine().await;
        let envelope = EventEnvelope::new(
            "comment.created",
            "t",
            "kid-1",
            json!({ "postId": "p1", "actorId": "friend", "excerpt": "cool drawing" }),
        )
        .with_priority(Priority::High);

        let outcome = engine.evaluate(&envelope).await.unwrap();
        let notification = outcome
            .notifications
            .iter()
            .find(|n| n.recipient_id == "kid-1")
            .unwrap();

        assert!(matches!(notification.kind, NotificationKind::Kid { .. }));
        assert_eq!(notification.channels, ChannelSet::in_app_only());
        assert_eq!(notification.priority, Priority::Low);
        assert_eq!(outcome.approvals.len(), 1);
    }

    #[tokio::test]
    async fn test_minor_like_is_replaced_by_guardian_alert() {
        let (engine, _) = engine().await;
        let envelope = EventEnvelope::new(
            "post.liked",
            "t",
            "kid-1",
            json!({ "postId": "p1", "actorId": "stranger" }),
        );

        let outcome = engine.evaluate(&envelope).await.unwrap();
        assert_eq!(outcome.violations.len(), 1);
        assert_eq!(outcome.notifications.len(), 1);
        assert_eq!(outcome.notifications[0].recipient_id, "parent-1");
        assert_eq!(
            outcome.notifications[0].notification_type,
            NotificationType::SafetyAlert
        );
    }

    #[tokio::test]
    async fn test_approved_request_is_delivered_on_reemission() {
        let (engine, _, approvals) = engine_with_store().await;
        let request = EventEnvelope::new("follow.requested", "t", "kid-1", json!({ "actorId": "friend" }));
        let record = approve(&engine, &approvals, &request).await;

        let outcome = engine
            .evaluate(&request.reemit_with_approval(record.id()))
            .await
            .unwrap();
        assert!(outcome.approvals.is_empty());
        let notification = outcome
            .notifications
            .iter()
            .find(|n| n.recipient_id == "kid-1")
            .unwrap();
        assert_eq!(notification.notification_type, NotificationType::FollowApproved);
    }

    #[tokio::test]
    async fn test_approval_cannot_be_reused_by_another_envelope() {
        let (engine, _, approvals) = engine_with_store().await;
        let request = EventEnvelope::new("follow.requested", "t", "kid-1", json!({ "actorId": "friend" }));
        let record = approve(&engine, &approvals, &request).await;

        let mut reused = EventEnvelope::new(
            "message.requested",
            "t",
            "kid-1",
            json!({ "actorId": "stranger", "conversationId": "c9" }),
        );
        reused.headers.approval_id = Some(record.id());
        reused.headers.parent_event_id = Some(request.id);

        let outcome = engine.evaluate(&reused).await.unwrap();
        assert!(outcome.notifications.iter().all(|n| n.recipient_id != "kid-1"));
        assert_eq!(outcome.approvals.len(), 1);
        assert_eq!(
            outcome.approvals[0].request_type,
            crate::notification::GuardianRequestType::MessageRequest
        );
    }

    #[tokio::test]
    async fn test_flagged_word_past_the_excerpt_is_caught() {
        let (engine, _) = engine().await;
        let content = format!("{} violence", "a".repeat(120));
        let envelope = EventEnvelope::new(
            "message.sent",
            "t",
            "kid-1",
            json!({ "conversationId": "c1", "actorId": "friend", "content": content }),
        );

        let outcome = engine.evaluate(&envelope).await.unwrap();
        assert!(outcome.notifications.iter().all(|n| n.recipient_id != "kid-1"));
        assert_eq!(outcome.violations.len(), 1);
        assert_eq!(outcome.violations[0].reason.as_str(), "flagged_content");
    }

    #[tokio::test]
    async fn test_no_disallowed_pair_for_minor_across_registry() {
        let (engine, _) = engine().await;
        let payload = json!({
            "postId": "p1", "repostId": "r1", "actorId": "someone", "conversationId": "c1",
            "groupId": "g1", "contentId": "x1", "message": "hello", "title": "t",
            "achievementName": "Star", "content": "hi"
        });

        for event_type in engine.registry().event_types() {
            let envelope = EventEnvelope::new(event_type, "t", "kid-1", payload.clone());
            let outcome = engine.evaluate(&envelope).await.unwrap();
            for notification in outcome.notifications.iter().filter(|n| n.recipient_id == "kid-1") {
                assert!(
                    KID_ALLOWED_TYPES.contains(&notification.notification_type),
                    "{event_type} produced {}",
                    notification.notification_type
                );
            }
        }
    }
}

//! Guardian approval lifecycle: open, act, expire, settle.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::instrument;
use uuid::Uuid;

use crate::broker::{EventEnvelope, EventProducer, Topic};
use crate::delivery::DeliveryRouter;
use crate::error::NotifyError;
use crate::metrics::GuardianMetrics;
use crate::notification::{
    materialize, ApprovalStatus, GuardianRequestType, NotificationDraft, NotificationKind,
    NotificationType, PolicyEngine, Priority,
};

use super::approval::{
    ApprovalError, ApprovalPolicy, ApprovalRecord, ApprovalRequest, DefaultOutcome, Resolution,
};
use super::store::ApprovalStore;

const PRODUCER_ID: &str = "guardian-service";
const OUTCOME_EVENT_TYPE: &str = "guardian.outcome";
const SWEEP_BATCH: usize = 100;

/// Counts from one expiry sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExpirySummary {
    pub expired: usize,
    pub settled: usize,
    pub failed: usize,
}

pub struct ApprovalService {
    store: Arc<dyn ApprovalStore>,
    router: Arc<DeliveryRouter>,
    engine: Arc<PolicyEngine>,
    producer: Arc<EventProducer>,
    policy: ApprovalPolicy,
}

impl ApprovalService {
    pub fn new(
        store: Arc<dyn ApprovalStore>,
        router: Arc<DeliveryRouter>,
        engine: Arc<PolicyEngine>,
        producer: Arc<EventProducer>,
        policy: ApprovalPolicy,
    ) -> Self {
        Self {
            store,
            router,
            engine,
            producer,
            policy,
        }
    }

    pub fn store(&self) -> &Arc<dyn ApprovalStore> {
        &self.store
    }

    pub fn policy(&self) -> &ApprovalPolicy {
        &self.policy
    }

    /// Record the request and notify the guardian. Safe to repeat: the
    /// record and the guardian notification are both keyed by the
    /// approval id.
    #[instrument(
        name = "approval.open",
        skip(self, request),
        fields(approval_id = %request.id, request_type = request.request_type.as_str())
    )]
    pub async fn open(&self, request: ApprovalRequest, now: DateTime<Utc>) -> Result<ApprovalRecord, NotifyError> {
        let id = request.id;
        let fresh = ApprovalRecord::pending(request, now, self.policy.window);
        let created = self.store.insert(&fresh).await?;

        let record = if created {
            GuardianMetrics::record_approval("opened");
            tracing::info!(
                guardian_id = %fresh.request.guardian_id,
                kid_account_id = %fresh.request.kid_account_id,
                expires_at = %fresh.expires_at,
                "Approval opened"
            );
            fresh
        } else {
            self.store.get(id).await?.ok_or(ApprovalError::NotFound(id))?
        };

        if record.status == ApprovalStatus::Pending {
            self.router.route(&guardian_request_notification(&record)).await?;
        }
        Ok(record)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<ApprovalRecord>, NotifyError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn pending_for_guardian(&self, guardian_id: &str) -> Result<Vec<ApprovalRecord>, NotifyError> {
        Ok(self.store.pending_for_guardian(guardian_id).await?)
    }

    pub async fn approve(&self, id: Uuid, guardian_id: &str, now: DateTime<Utc>) -> Result<ApprovalRecord, NotifyError> {
        self.act(id, guardian_id, ApprovalStatus::Approved, now).await
    }

    pub async fn deny(&self, id: Uuid, guardian_id: &str, now: DateTime<Utc>) -> Result<ApprovalRecord, NotifyError> {
        self.act(id, guardian_id, ApprovalStatus::Denied, now).await
    }

    #[instrument(name = "approval.act", skip(self), fields(status = status.as_str()))]
    async fn act(
        &self,
        id: Uuid,
        guardian_id: &str,
        status: ApprovalStatus,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRecord, NotifyError> {
        let record = self.store.get(id).await?.ok_or(ApprovalError::NotFound(id))?;
        if record.request.guardian_id != guardian_id {
            return Err(ApprovalError::NotGuardian {
                approval_id: id,
                user_id: guardian_id.to_string(),
            }
            .into());
        }

        if record.is_overdue(now) {
            self.expire(&record, now).await?;
            return Err(NotifyError::ApprovalExpired(id));
        }

        let Some(resolved) = self
            .store
            .resolve(id, &Resolution::by_guardian(status, guardian_id, now))
            .await?
        else {
            let current = self
                .store
                .get(id)
                .await?
                .map(|r| r.status)
                .unwrap_or(record.status);
            return Err(ApprovalError::AlreadyResolved {
                approval_id: id,
                status: current.as_str(),
            }
            .into());
        };

        GuardianMetrics::record_approval(status.as_str());
        tracing::info!(approval_id = %id, guardian_id, "Approval resolved by guardian");

        self.after_resolve(&resolved).await?;
        Ok(resolved)
    }

    /// Expire overdue requests and finish any whose effect did not go out.
    #[instrument(name = "approval.expire_due", skip(self))]
    pub async fn expire_due(&self, now: DateTime<Utc>) -> Result<ExpirySummary, NotifyError> {
        let mut summary = ExpirySummary::default();

        for record in self.store.unsettled(now, SWEEP_BATCH).await? {
            let result = if record.is_overdue(now) {
                match self.expire(&record, now).await {
                    Ok(true) => {
                        summary.expired += 1;
                        Ok(())
                    }
                    Ok(false) => Ok(()),
                    Err(e) => Err(e),
                }
            } else if record.needs_settlement() {
                self.settle(&record).await.map(|()| summary.settled += 1)
            } else {
                Ok(())
            };

            if let Err(e) = result {
                summary.failed += 1;
                tracing::warn!(approval_id = %record.id(), error = %e, "Approval sweep step failed");
            }
        }

        if summary != ExpirySummary::default() {
            tracing::info!(
                expired = summary.expired,
                settled = summary.settled,
                failed = summary.failed,
                "Approval sweep finished"
            );
        }
        Ok(summary)
    }

    /// Compare-and-set to expired with the type's default outcome. `false`
    /// when someone else resolved it first.
    async fn expire(&self, record: &ApprovalRecord, now: DateTime<Utc>) -> Result<bool, NotifyError> {
        let outcome = self.policy.outcome_for(record.request.request_type);
        let Some(expired) = self
            .store
            .resolve(record.id(), &Resolution::expiry(outcome, now))
            .await?
        else {
            return Ok(false);
        };

        GuardianMetrics::record_approval("expired");
        tracing::info!(
            approval_id = %record.id(),
            default_outcome = outcome.as_str(),
            "Approval expired"
        );
        self.after_resolve(&expired).await?;
        Ok(true)
    }

    async fn after_resolve(&self, record: &ApprovalRecord) -> Result<(), NotifyError> {
        if let Err(e) = self
            .router
            .inbox()
            .resolve_guardian_status(record.id(), record.status)
            .await
        {
            tracing::warn!(approval_id = %record.id(), error = %e, "Failed to update guardian notification");
        }
        self.settle(record).await
    }

    /// Send the terminal effect of a resolved record, then flag it. Every
    /// effect is idempotent, so a settle repeated after a crash lands on
    /// the same dedup keys.
    async fn settle(&self, record: &ApprovalRecord) -> Result<(), NotifyError> {
        let request = &record.request;

        match (record.status, record.applied_outcome) {
            (ApprovalStatus::Approved, _) => {
                self.reemit(record).await?;
            }
            (ApprovalStatus::Expired, Some(DefaultOutcome::Approve)) => {
                self.reemit(record).await?;
                self.notify_outcome(record, self.outcome_recipient(record)).await?;
            }
            (ApprovalStatus::Expired, Some(DefaultOutcome::Acknowledge)) => {
                self.notify_outcome(record, &request.guardian_id).await?;
            }
            (ApprovalStatus::Denied, _) | (ApprovalStatus::Expired, _) => {
                self.notify_outcome(record, self.outcome_recipient(record)).await?;
            }
            (ApprovalStatus::Pending, _) => return Ok(()),
        }

        self.store.mark_outcome_emitted(record.id()).await?;
        Ok(())
    }

    fn outcome_recipient<'a>(&self, record: &'a ApprovalRecord) -> &'a str {
        match record.request.request_type {
            GuardianRequestType::ActivityReview => &record.request.guardian_id,
            _ => record
                .request
                .requester_id
                .as_deref()
                .unwrap_or(&record.request.guardian_id),
        }
    }

    async fn reemit(&self, record: &ApprovalRecord) -> Result<(), NotifyError> {
        if record.request.request_type == GuardianRequestType::ActivityReview {
            return Ok(());
        }
        let original = &record.request.envelope;
        let envelope = original.reemit_with_approval(record.id());
        let receipt = self
            .producer
            .publish(Topic::for_event_type(&envelope.event_type), &envelope)
            .await?;
        tracing::info!(
            approval_id = %record.id(),
            event_id = %envelope.id,
            parent_event_id = %original.id,
            duplicate = receipt.is_duplicate(),
            "Approved envelope re-emitted"
        );
        Ok(())
    }

    async fn notify_outcome(&self, record: &ApprovalRecord, recipient_id: &str) -> Result<(), NotifyError> {
        let request = &record.request;
        let envelope = outcome_envelope(record, recipient_id);
        let (title, message) = outcome_text(record);

        let draft = NotificationDraft::new(recipient_id, NotificationType::GuardianMessage, title, message)
            .from_sender(Some(request.guardian_id.clone()))
            .with_metadata("approvalId", record.id().to_string())
            .with_metadata("status", record.status.as_str())
            .with_metadata("requestType", request.request_type.as_str());

        let outcome = self.engine.apply(&envelope, [draft]).await?;
        if !outcome.approvals.is_empty() {
            tracing::debug!(approval_id = %record.id(), "Ignoring approvals raised by an outcome notice");
        }
        for notification in &outcome.notifications {
            self.router.route(notification).await?;
        }
        Ok(())
    }
}

/// Synthetic envelope for outcome notices. Its id is the approval id so the
/// notice id is fixed per (approval, recipient).
fn outcome_envelope(record: &ApprovalRecord, recipient_id: &str) -> EventEnvelope {
    let mut envelope = EventEnvelope::new(
        OUTCOME_EVENT_TYPE,
        PRODUCER_ID,
        recipient_id,
        json!({
            "approvalId": record.id(),
            "status": record.status.as_str(),
            "kidAccountId": record.request.kid_account_id,
        }),
    );
    envelope.id = record.id();
    envelope.headers.parent_event_id = Some(record.request.envelope.id);
    envelope
}

fn outcome_text(record: &ApprovalRecord) -> (String, String) {
    let what = record.request.request_type.describe();
    match (record.status, record.applied_outcome) {
        (ApprovalStatus::Approved, _) | (ApprovalStatus::Expired, Some(DefaultOutcome::Approve)) => (
            "Request approved".to_string(),
            format!("Your {} was approved", what),
        ),
        (ApprovalStatus::Expired, Some(DefaultOutcome::Acknowledge)) => (
            "Review closed".to_string(),
            format!("The {} for {} was closed without action", what, record.request.kid_account_id),
        ),
        (ApprovalStatus::Expired, _) => (
            "Request expired".to_string(),
            format!("Your {} expired without a guardian decision", what),
        ),
        _ => (
            "Request declined".to_string(),
            format!("Your {} was declined by a guardian", what),
        ),
    }
}

/// The guardian-facing request. Its id is the approval id, which is how the
/// inbox entry is found again when the request resolves.
fn guardian_request_notification(record: &ApprovalRecord) -> crate::notification::Notification {
    let request = &record.request;
    let draft = NotificationDraft::new(
        request.guardian_id.as_str(),
        NotificationType::GuardianApprovalRequest,
        request.title.as_str(),
        request.message.as_str(),
    )
    .from_sender(request.requester_id.clone())
    .with_priority(Priority::High)
    .with_kind(NotificationKind::Guardian {
        approval_id: request.id,
        request_type: request.request_type,
        kid_account_id: request.kid_account_id.clone(),
        target_user_id: request.requester_id.clone(),
        status: ApprovalStatus::Pending,
        expires_at: record.expires_at,
        requires_action: true,
    });

    let mut notification = materialize(draft, &request.envelope);
    notification.id = request.id;
    notification
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use chrono::Duration;

    use super::*;
    use crate::broker::{partition_for, BrokerBackend, MemoryBrokerBackend, ReadCursor};
    use crate::delivery::LoggingDispatcher;
    use crate::guardian::MemoryApprovalStore;
    use crate::inbox::{InboxBackend, MemoryInboxBackend};
    use crate::notification::{
        AccountDirectory, AccountProfile, BuilderRegistry, KidSafetyGate, MemoryAccountDirectory,
    };
    use crate::presence::{MemoryRoomDirectory, PresenceGateway, PresenceLimits};
    use crate::resilience::BackoffConfig;

    struct Fixture {
        service: ApprovalService,
        inbox: Arc<MemoryInboxBackend>,
        broker: Arc<MemoryBrokerBackend>,
    }

    async fn fixture(policy: ApprovalPolicy) -> Fixture {
        let directory = Arc::new(MemoryAccountDirectory::new());
        directory
            .upsert(AccountProfile::minor("kid-1", "parent-1"))
            .await
            .unwrap();
        let store: Arc<dyn ApprovalStore> = Arc::new(MemoryApprovalStore::new());
        let inbox = Arc::new(MemoryInboxBackend::new());
        let broker = Arc::new(MemoryBrokerBackend::new());
        let presence = Arc::new(PresenceGateway::new(
            Arc::new(MemoryRoomDirectory::new()),
            PresenceLimits::default(),
        ));
        let router = Arc::new(DeliveryRouter::new(
            inbox.clone(),
            presence,
            Arc::new(LoggingDispatcher),
        ));
        let engine = Arc::new(PolicyEngine::new(
            BuilderRegistry::with_defaults(),
            directory,
            store.clone(),
            KidSafetyGate::new(0.8, []),
        ));
        let producer = Arc::new(EventProducer::new(
            broker.clone(),
            4,
            StdDuration::from_secs(60),
            BackoffConfig {
                initial_delay_ms: 1,
                max_delay_ms: 2,
                multiplier: 2.0,
                jitter_factor: 0.0,
                max_attempts: Some(2),
            },
        ));
        Fixture {
            service: ApprovalService::new(store, router, engine, producer, policy),
            inbox,
            broker,
        }
    }

    fn follow_request() -> ApprovalRequest {
        let envelope = EventEnvelope::new(
            "follow.requested",
            "social",
            "kid-1",
            json!({ "actorId": "stranger" }),
        );
        let draft = NotificationDraft::new("kid-1", NotificationType::FollowRequest, "Follow request", "x")
            .from_sender(Some("stranger".into()));
        ApprovalRequest::from_draft(&envelope, &draft, "parent-1", GuardianRequestType::FollowRequest)
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let f = fixture(ApprovalPolicy::new(Duration::hours(72))).await;
        let request = follow_request();
        let now = Utc::now();

        let first = f.service.open(request.clone(), now).await.unwrap();
        let second = f.service.open(request.clone(), now + Duration::minutes(5)).await.unwrap();
        assert_eq!(first.expires_at, second.expires_at);
        assert_eq!(first.expires_at, now + Duration::hours(72));

        let guardian_inbox = f.inbox.for_user("parent-1");
        assert_eq!(guardian_inbox.len(), 1);
        assert_eq!(guardian_inbox[0].id, request.id);
        assert!(guardian_inbox[0].is_guardian_pending());
    }

    #[tokio::test]
    async fn test_only_the_guardian_may_act() {
        let f = fixture(ApprovalPolicy::new(Duration::hours(72))).await;
        let record = f.service.open(follow_request(), Utc::now()).await.unwrap();

        let err = f.service.approve(record.id(), "someone-else", Utc::now()).await.unwrap_err();
        assert!(matches!(err, NotifyError::Approval(ApprovalError::NotGuardian { .. })));
    }

    #[tokio::test]
    async fn test_approve_reemits_with_approval_header() {
        let f = fixture(ApprovalPolicy::new(Duration::hours(72))).await;
        let request = follow_request();
        let original_id = request.envelope.id;
        let record = f.service.open(request, Utc::now()).await.unwrap();

        let approved = f.service.approve(record.id(), "parent-1", Utc::now()).await.unwrap();
        assert_eq!(approved.status, ApprovalStatus::Approved);
        assert!(f.service.get(record.id()).await.unwrap().unwrap().outcome_emitted);

        let partition = partition_for("kid-1", 4);
        f.broker.ensure_group(Topic::Social, partition, "test").await.unwrap();
        let records = f
            .broker
            .read_group(Topic::Social, partition, "test", "c1", ReadCursor::New, 10)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        let reemitted = records[0].decode().unwrap();
        assert_eq!(reemitted.headers.approval_id, Some(record.id()));
        assert_eq!(reemitted.headers.parent_event_id, Some(original_id));

        let guardian = f.inbox.get(record.id()).await.unwrap().unwrap();
        assert!(!guardian.is_guardian_pending());

        let err = f.service.deny(record.id(), "parent-1", Utc::now()).await.unwrap_err();
        assert!(matches!(err, NotifyError::Approval(ApprovalError::AlreadyResolved { .. })));
    }

    #[tokio::test]
    async fn test_deny_notifies_requester_once() {
        let f = fixture(ApprovalPolicy::new(Duration::hours(72))).await;
        let record = f.service.open(follow_request(), Utc::now()).await.unwrap();

        f.service.deny(record.id(), "parent-1", Utc::now()).await.unwrap();
        f.service.expire_due(Utc::now() + Duration::days(10)).await.unwrap();

        let notices = f.inbox.for_user("stranger");
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].notification_type, NotificationType::GuardianMessage);
        assert_eq!(f.broker.total_records(), 0);
    }

    #[tokio::test]
    async fn test_deny_without_requester_notifies_guardian() {
        let f = fixture(ApprovalPolicy::new(Duration::hours(72))).await;
        let mut request = follow_request();
        request.requester_id = None;
        let record = f.service.open(request, Utc::now()).await.unwrap();

        f.service.deny(record.id(), "parent-1", Utc::now()).await.unwrap();

        let notices: Vec<_> = f
            .inbox
            .for_user("parent-1")
            .into_iter()
            .filter(|n| n.notification_type == NotificationType::GuardianMessage)
            .collect();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].metadata["status"], "denied");
    }

    #[tokio::test]
    async fn test_acting_after_expiry_expires_first() {
        let f = fixture(ApprovalPolicy::new(Duration::hours(1))).await;
        let opened = Utc::now();
        let record = f.service.open(follow_request(), opened).await.unwrap();

        let err = f
            .service
            .approve(record.id(), "parent-1", opened + Duration::hours(2))
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::ApprovalExpired(_)));

        let stored = f.service.get(record.id()).await.unwrap().unwrap();
        assert_eq!(stored.status, ApprovalStatus::Expired);
        assert_eq!(stored.applied_outcome, Some(DefaultOutcome::Deny));
        assert_eq!(f.inbox.for_user("stranger").len(), 1);
    }

    #[tokio::test]
    async fn test_expire_due_runs_once() {
        let f = fixture(ApprovalPolicy::new(Duration::hours(1))).await;
        let opened = Utc::now();
        let record = f.service.open(follow_request(), opened).await.unwrap();
        let later = opened + Duration::hours(2);

        assert_eq!(f.service.expire_due(opened).await.unwrap(), ExpirySummary::default());

        let first = f.service.expire_due(later).await.unwrap();
        let second = f.service.expire_due(later).await.unwrap();
        assert_eq!(first.expired, 1);
        assert_eq!(second, ExpirySummary::default());
        assert_eq!(f.inbox.for_user("stranger").len(), 1);
        assert!(f.service.get(record.id()).await.unwrap().unwrap().outcome_emitted);
    }

    #[tokio::test]
    async fn test_expiry_with_approve_default_reemits() {
        let policy = ApprovalPolicy::new(Duration::hours(1))
            .with_outcome(GuardianRequestType::FollowRequest, DefaultOutcome::Approve);
        let f = fixture(policy).await;
        let opened = Utc::now();
        f.service.open(follow_request(), opened).await.unwrap();

        let summary = f.service.expire_due(opened + Duration::hours(2)).await.unwrap();
        assert_eq!(summary.expired, 1);
        assert_eq!(f.broker.total_records(), 1);
        assert_eq!(f.inbox.for_user("stranger").len(), 1);
    }
}

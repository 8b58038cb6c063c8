//! The envelope handler: policy, approvals, then delivery.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::instrument;

use crate::broker::{EnvelopeHandler, EventEnvelope};
use crate::delivery::{DeliveryRouter, RouteOutcome};
use crate::error::NotifyError;
use crate::guardian::ApprovalService;
use crate::notification::{NotificationDraft, PolicyEngine, PolicyOutcome};

/// What one envelope turned into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineReport {
    pub stored: usize,
    pub duplicates: usize,
    pub pushed: usize,
    pub approvals: usize,
    pub violations: usize,
}

pub struct NotificationPipeline {
    engine: Arc<PolicyEngine>,
    router: Arc<DeliveryRouter>,
    approvals: Arc<ApprovalService>,
}

impl NotificationPipeline {
    pub fn new(
        engine: Arc<PolicyEngine>,
        router: Arc<DeliveryRouter>,
        approvals: Arc<ApprovalService>,
    ) -> Self {
        Self {
            engine,
            router,
            approvals,
        }
    }

    pub fn engine(&self) -> &Arc<PolicyEngine> {
        &self.engine
    }

    pub fn router(&self) -> &Arc<DeliveryRouter> {
        &self.router
    }

    pub fn approvals(&self) -> &Arc<ApprovalService> {
        &self.approvals
    }

    /// Evaluate a broker envelope through the registry and deliver the result.
    #[instrument(
        name = "pipeline.process",
        skip(self, envelope),
        fields(event_id = %envelope.id, event_type = %envelope.event_type)
    )]
    pub async fn process(&self, envelope: &EventEnvelope) -> Result<PipelineReport, NotifyError> {
        let outcome = self.engine.evaluate(envelope).await?;
        self.complete(outcome).await
    }

    /// Gate and deliver drafts built outside the registry.
    pub async fn deliver(
        &self,
        envelope: &EventEnvelope,
        drafts: Vec<NotificationDraft>,
    ) -> Result<PipelineReport, NotifyError> {
        let outcome = self.engine.apply(envelope, drafts).await?;
        self.complete(outcome).await
    }

    async fn complete(&self, outcome: PolicyOutcome) -> Result<PipelineReport, NotifyError> {
        let mut report = PipelineReport {
            violations: outcome.violations.len(),
            ..Default::default()
        };

        let now = Utc::now();
        for request in outcome.approvals {
            self.approvals.open(request, now).await?;
            report.approvals += 1;
        }

        for notification in &outcome.notifications {
            match self.router.route(notification).await? {
                RouteOutcome::Duplicate => report.duplicates += 1,
                RouteOutcome::Stored { pushed, .. } => {
                    report.stored += 1;
                    if pushed {
                        report.pushed += 1;
                    }
                }
            }
        }

        tracing::debug!(
            stored = report.stored,
            duplicates = report.duplicates,
            approvals = report.approvals,
            violations = report.violations,
            "Envelope processed"
        );
        Ok(report)
    }
}

#[async_trait]
impl EnvelopeHandler for NotificationPipeline {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), NotifyError> {
        self.process(envelope).await.map(|_| ())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    use super::*;
    use crate::broker::{EventProducer, MemoryBrokerBackend};
    use crate::delivery::LoggingDispatcher;
    use crate::guardian::{ApprovalPolicy, ApprovalStore, MemoryApprovalStore};
    use crate::inbox::{InboxBackend, MemoryInboxBackend};
    use crate::notification::{
        AccountDirectory, AccountProfile, BuilderRegistry, KidSafetyGate, MemoryAccountDirectory,
        NotificationType,
    };
    use crate::presence::{MemoryRoomDirectory, PresenceGateway, PresenceLimits};
    use crate::resilience::BackoffConfig;

    /// In-memory pipeline over the given directory and inbox.
    pub fn pipeline_with(
        directory: Arc<dyn AccountDirectory>,
        inbox: Arc<dyn InboxBackend>,
    ) -> Arc<NotificationPipeline> {
        let store: Arc<dyn ApprovalStore> = Arc::new(MemoryApprovalStore::new());
        let presence = Arc::new(PresenceGateway::new(
            Arc::new(MemoryRoomDirectory::new()),
            PresenceLimits::default(),
        ));
        let router = Arc::new(DeliveryRouter::new(inbox, presence, Arc::new(LoggingDispatcher)));
        let engine = Arc::new(PolicyEngine::new(
            BuilderRegistry::with_defaults(),
            directory,
            store.clone(),
            KidSafetyGate::new(0.8, []),
        ));
        let producer = Arc::new(EventProducer::new(
            Arc::new(MemoryBrokerBackend::new()),
            4,
            Duration::from_secs(60),
            BackoffConfig::default(),
        ));
        let approvals = Arc::new(ApprovalService::new(
            store,
            router.clone(),
            engine.clone(),
            producer,
            ApprovalPolicy::new(ChronoDuration::hours(72)),
        ));
        Arc::new(NotificationPipeline::new(engine, router, approvals))
    }

    async fn fixture() -> (Arc<NotificationPipeline>, Arc<MemoryInboxBackend>) {
        let directory = Arc::new(MemoryAccountDirectory::new());
        directory
            .upsert(AccountProfile::minor("kid-1", "parent-1"))
            .await
            .unwrap();
        let inbox = Arc::new(MemoryInboxBackend::new());
        (pipeline_with(directory, inbox.clone()), inbox)
    }

    #[tokio::test]
    async fn test_handling_twice_stores_once() {
        let (pipeline, inbox) = fixture().await;
        let envelope = EventEnvelope::new(
            "post.liked",
            "social",
            "adult-1",
            json!({ "postId": "p1", "actorId": "a2" }),
        );

        let first = pipeline.process(&envelope).await.unwrap();
        let second = pipeline.process(&envelope).await.unwrap();
        assert_eq!(first.stored, 1);
        assert_eq!(second.stored, 0);
        assert_eq!(second.duplicates, 1);
        assert_eq!(inbox.for_user("adult-1").len(), 1);
    }

    #[tokio::test]
    async fn test_follow_request_to_minor_opens_approval() {
        let (pipeline, inbox) = fixture().await;
        let envelope = EventEnvelope::new(
            "follow.requested",
            "social",
            "kid-1",
            json!({ "actorId": "stranger" }),
        );

        let report = pipeline.process(&envelope).await.unwrap();
        assert_eq!(report.approvals, 1);
        assert!(inbox.for_user("kid-1").is_empty());

        let guardian = inbox.for_user("parent-1");
        assert_eq!(guardian.len(), 1);
        assert_eq!(
            guardian[0].notification_type,
            NotificationType::GuardianApprovalRequest
        );
        let pending = pipeline
            .approvals()
            .pending_for_guardian("parent-1")
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_event_is_resolved_error() {
        let (pipeline, _) = fixture().await;
        let envelope = EventEnvelope::new("nope.nothing", "t", "u1", json!({}));
        let err = pipeline.handle(&envelope).await.unwrap_err();
        assert!(err.is_resolved());
    }
}

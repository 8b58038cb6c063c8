use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;

use crate::broker::{BrokerClient, Topic};
use crate::inbox::{InboxBackend, RetentionPolicy};
use crate::messaging::ConversationService;
use crate::metrics::InboxMetrics;

/// What one retention pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPass {
    pub notifications: usize,
    pub stream_records: u64,
    pub messages: usize,
    pub unread_counters: usize,
}

/// Deletes inbox rows past their channel retention, trims broker streams
/// past their topic retention and prunes live conversation state.
pub struct RetentionTask {
    interval: Duration,
    policy: RetentionPolicy,
    inbox: Arc<dyn InboxBackend>,
    broker: Arc<BrokerClient>,
    conversations: Option<(Arc<ConversationService>, chrono::Duration)>,
    shutdown: broadcast::Receiver<()>,
}

impl RetentionTask {
    pub fn new(
        interval_secs: u64,
        policy: RetentionPolicy,
        inbox: Arc<dyn InboxBackend>,
        broker: Arc<BrokerClient>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            interval: Duration::from_secs(interval_secs.max(1)),
            policy,
            inbox,
            broker,
            conversations: None,
            shutdown,
        }
    }

    /// Also drop conversation messages older than `retention`.
    pub fn with_conversations(
        mut self,
        conversations: Arc<ConversationService>,
        retention: chrono::Duration,
    ) -> Self {
        self.conversations = Some((conversations, retention));
        self
    }

    pub async fn run(mut self) {
        let mut timer = tokio::time::interval(self.interval);
        timer.tick().await;

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            inbox_backend = self.inbox.name(),
            "Retention task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Retention task received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    let pass = self.run_once().await;
                    if pass != RetentionPass::default() {
                        tracing::info!(
                            notifications = pass.notifications,
                            stream_records = pass.stream_records,
                            messages = pass.messages,
                            unread_counters = pass.unread_counters,
                            "Retention pass completed"
                        );
                    }
                }
            }
        }

        tracing::info!("Retention task stopped");
    }

    /// One pass. Each store fails independently and is retried next tick.
    pub async fn run_once(&self) -> RetentionPass {
        let mut pass = RetentionPass::default();
        let now = Utc::now();

        match self.inbox.cleanup_expired(&self.policy, now).await {
            Ok(deleted) => {
                InboxMetrics::record_expired(deleted);
                pass.notifications = deleted;
            }
            Err(e) => tracing::warn!(error = %e, "Inbox retention cleanup failed"),
        }

        match self.broker.trim_expired(&Topic::ALL).await {
            Ok(trimmed) => pass.stream_records = trimmed,
            Err(e) => tracing::warn!(error = %e, "Broker stream trim failed"),
        }

        if let Some((conversations, retention)) = &self.conversations {
            let pruned = conversations.prune(now - *retention);
            pass.messages = pruned.messages;
            pass.unread_counters = pruned.unread_counters;
        }

        pass
    }
}

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use crate::config::PresenceConfig;
use crate::messaging::ConversationService;
use crate::presence::{Disconnected, PresenceGateway};
use crate::websocket::{ServerMessage, UserStatus};

/// Heartbeats to every session and eviction of idle ones
pub struct LivenessTask {
    config: PresenceConfig,
    presence: Arc<PresenceGateway>,
    conversations: Arc<ConversationService>,
    shutdown: broadcast::Receiver<()>,
}

impl LivenessTask {
    pub fn new(
        config: PresenceConfig,
        presence: Arc<PresenceGateway>,
        conversations: Arc<ConversationService>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            config,
            presence,
            conversations,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let heartbeat_interval = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
        let sweep_interval = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        let idle_timeout = self.config.idle_timeout();

        let mut heartbeat_timer = tokio::time::interval(heartbeat_interval);
        let mut sweep_timer = tokio::time::interval(sweep_interval);

        // Skip immediate first tick
        heartbeat_timer.tick().await;
        sweep_timer.tick().await;

        tracing::info!(
            heartbeat_interval_secs = heartbeat_interval.as_secs(),
            sweep_interval_secs = sweep_interval.as_secs(),
            idle_timeout_secs = idle_timeout.as_secs(),
            "Liveness task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Liveness task received shutdown signal");
                    break;
                }
                _ = heartbeat_timer.tick() => {
                    self.send_heartbeats();
                }
                _ = sweep_timer.tick() => {
                    let evicted = self.presence.sweep_idle(idle_timeout);
                    self.announce_offline(&evicted).await;
                }
            }
        }

        tracing::info!("Liveness task stopped");
    }

    fn send_heartbeats(&self) {
        let start = Instant::now();
        let report = self.presence.broadcast_all(&ServerMessage::Heartbeat);
        if report.delivered + report.failed == 0 {
            return;
        }

        tracing::debug!(
            sent = report.delivered,
            failed = report.failed,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Heartbeats sent"
        );
    }

    async fn announce_offline(&self, evicted: &[Disconnected]) {
        for gone in evicted.iter().filter(|d| d.went_offline) {
            if let Err(e) = self
                .conversations
                .broadcast_status(&gone.user_id, UserStatus::Offline)
                .await
            {
                tracing::warn!(user_id = %gone.user_id, error = %e, "Failed to broadcast offline status");
            }
        }
    }
}

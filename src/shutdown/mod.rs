//! Coordinated shutdown.
//!
//! 1. Tell every live session to reconnect elsewhere
//! 2. Stop the broker consumer and background tasks
//! 3. Wait for them to finish, bounded
//! 4. Wait for sessions to close, bounded

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::presence::PresenceGateway;
use crate::websocket::ServerMessage;

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Bound on waiting for the consumer and background tasks
    pub task_timeout: Duration,
    /// Bound on waiting for sessions to close
    pub drain_timeout: Duration,
    /// Suggested reconnect delay sent to clients
    pub reconnect_after_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(15),
            drain_timeout: Duration::from_secs(10),
            reconnect_after_secs: 5,
        }
    }
}

pub struct GracefulShutdown {
    presence: Arc<PresenceGateway>,
    shutdown_tx: broadcast::Sender<()>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(presence: Arc<PresenceGateway>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self::with_config(presence, shutdown_tx, ShutdownConfig::default())
    }

    pub fn with_config(
        presence: Arc<PresenceGateway>,
        shutdown_tx: broadcast::Sender<()>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            presence,
            shutdown_tx,
            config,
        }
    }

    /// Run the sequence. `tasks` are the handles of everything subscribed
    /// to the shutdown broadcast; an uncommitted broker record left by an
    /// interrupted consumer is redelivered on the next start.
    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self, tasks),
        fields(sessions = self.presence.stats().sessions, tasks = tasks.len())
    )]
    pub async fn execute(&self, reason: &str, tasks: Vec<JoinHandle<()>>) -> ShutdownResult {
        let start = Instant::now();
        let mut result = ShutdownResult::default();

        tracing::info!(reason = %reason, "Starting graceful shutdown - Phase 1: Notifying clients");
        result.clients_notified = self.notify_clients();

        tracing::info!("Phase 2: Signaling background tasks to stop");
        // Err only means nothing is subscribed any more
        let _ = self.shutdown_tx.send(());

        tracing::info!("Phase 3: Waiting for background tasks");
        result.tasks_stopped = self.wait_for_tasks(tasks).await;

        tracing::info!("Phase 4: Waiting for sessions to close");
        result.sessions_remaining = self.wait_for_sessions().await;

        result.duration = start.elapsed();
        result.success = result.tasks_stopped && result.sessions_remaining == 0;

        tracing::info!(
            clients_notified = result.clients_notified,
            tasks_stopped = result.tasks_stopped,
            sessions_remaining = result.sessions_remaining,
            duration_ms = result.duration.as_millis() as u64,
            "Graceful shutdown completed"
        );

        result
    }

    fn notify_clients(&self) -> usize {
        let message = ServerMessage::Shutdown {
            reconnect_after_secs: self.config.reconnect_after_secs,
        };
        let report = self.presence.broadcast_all(&message);
        if report.failed > 0 {
            tracing::debug!(failed = report.failed, "Some sessions missed the shutdown notice");
        }
        report.delivered
    }

    async fn wait_for_tasks(&self, tasks: Vec<JoinHandle<()>>) -> bool {
        if tasks.is_empty() {
            return true;
        }

        match timeout(self.config.task_timeout, join_all(tasks)).await {
            Ok(results) => {
                for e in results.into_iter().filter_map(Result::err) {
                    tracing::error!(error = %e, "Background task ended abnormally");
                }
                true
            }
            Err(_) => {
                tracing::warn!(
                    timeout_secs = self.config.task_timeout.as_secs(),
                    "Background tasks did not stop in time"
                );
                false
            }
        }
    }

    async fn wait_for_sessions(&self) -> usize {
        if self.presence.stats().sessions == 0 {
            return 0;
        }

        let drained = async {
            loop {
                tokio::time::sleep(Duration::from_millis(100)).await;
                if self.presence.stats().sessions == 0 {
                    break;
                }
            }
        };
        let _ = timeout(self.config.drain_timeout, drained).await;

        let remaining = self.presence.stats().sessions;
        if remaining > 0 {
            tracing::warn!(
                remaining_sessions = remaining,
                "Some sessions did not close gracefully"
            );
        }
        remaining
    }
}

#[derive(Debug, Default)]
pub struct ShutdownResult {
    pub success: bool,
    pub clients_notified: usize,
    pub tasks_stopped: bool,
    pub sessions_remaining: usize,
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::presence::{MemoryRoomDirectory, PresenceLimits};

    fn gateway() -> Arc<PresenceGateway> {
        Arc::new(PresenceGateway::new(
            Arc::new(MemoryRoomDirectory::new()),
            PresenceLimits::default(),
        ))
    }

    fn quick() -> ShutdownConfig {
        ShutdownConfig {
            task_timeout: Duration::from_millis(200),
            drain_timeout: Duration::from_millis(300),
            reconnect_after_secs: 3,
        }
    }

    #[tokio::test]
    async fn test_shutdown_with_nothing_running() {
        let (tx, _) = broadcast::channel(1);
        let shutdown = GracefulShutdown::new(gateway(), tx);

        let result = shutdown.execute("test", Vec::new()).await;

        assert!(result.success);
        assert_eq!(result.clients_notified, 0);
        assert_eq!(result.sessions_remaining, 0);
    }

    #[tokio::test]
    async fn test_clients_told_to_reconnect_and_tasks_stopped() {
        let presence = gateway();
        let (tx, mut rx) = mpsc::channel(4);
        let connected = presence.connect("alice", tx).unwrap();

        let (shutdown_tx, mut task_rx) = broadcast::channel(1);
        let task = tokio::spawn(async move {
            let _ = task_rx.recv().await;
        });

        // Stand-in for the socket handler closing on the notice
        let closer = {
            let presence = presence.clone();
            let id = connected.session.connection_id;
            tokio::spawn(async move {
                let first = rx.recv().await;
                presence.disconnect(id);
                first
            })
        };

        let shutdown = GracefulShutdown::with_config(presence, shutdown_tx, quick());
        let result = shutdown.execute("deploy", vec![task]).await;

        assert!(result.success);
        assert_eq!(result.clients_notified, 1);
        assert!(result.tasks_stopped);
        assert_eq!(
            closer.await.unwrap(),
            Some(ServerMessage::Shutdown {
                reconnect_after_secs: 3
            })
        );
    }

    #[tokio::test]
    async fn test_stuck_task_and_session_are_reported() {
        let presence = gateway();
        let (tx, _rx) = mpsc::channel(4);
        presence.connect("bob", tx).unwrap();

        let (shutdown_tx, _) = broadcast::channel(1);
        let stuck = tokio::spawn(std::future::pending::<()>());

        let shutdown = GracefulShutdown::with_config(presence, shutdown_tx, quick());
        let result = shutdown.execute("deploy", vec![stuck]).await;

        assert!(!result.success);
        assert!(!result.tasks_stopped);
        assert_eq!(result.sessions_remaining, 1);
    }
}

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;

use crate::guardian::ApprovalService;

/// Settles guardian requests whose approval window has passed.
pub struct ApprovalSweeper {
    interval: Duration,
    approvals: Arc<ApprovalService>,
    shutdown: broadcast::Receiver<()>,
}

impl ApprovalSweeper {
    pub fn new(
        interval_secs: u64,
        approvals: Arc<ApprovalService>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            interval: Duration::from_secs(interval_secs.max(1)),
            approvals,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut timer = tokio::time::interval(self.interval);
        timer.tick().await;

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "Approval sweeper started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Approval sweeper received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    // The summary is logged by the service; failures are retried next tick
                    if let Err(e) = self.approvals.expire_due(Utc::now()).await {
                        tracing::warn!(error = %e, "Approval expiry sweep failed");
                    }
                }
            }
        }

        tracing::info!("Approval sweeper stopped");
    }
}

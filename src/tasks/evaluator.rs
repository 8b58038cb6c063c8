use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;

use crate::guardian::{EvaluationSummary, IndependenceService};

/// Periodic independence re-evaluation so date-driven phase changes
/// happen without a profile update.
pub struct IndependenceEvaluator {
    interval: Duration,
    independence: Arc<IndependenceService>,
    shutdown: broadcast::Receiver<()>,
}

impl IndependenceEvaluator {
    pub fn new(
        interval_secs: u64,
        independence: Arc<IndependenceService>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            interval: Duration::from_secs(interval_secs.max(1)),
            independence,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut timer = tokio::time::interval(self.interval);
        timer.tick().await;

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "Independence evaluator started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Independence evaluator received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    match self.independence.evaluate_all(Utc::now()).await {
                        Ok(summary) if summary == EvaluationSummary::default() => {}
                        Ok(summary) => {
                            tracing::info!(
                                advanced = summary.advanced,
                                notices_resent = summary.notices_resent,
                                failed = summary.failed,
                                "Independence evaluation pass finished"
                            );
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Independence evaluation failed");
                        }
                    }
                }
            }
        }

        tracing::info!("Independence evaluator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guardian::{IndependenceRules, MemoryIndependenceStore};
    use crate::inbox::MemoryInboxBackend;
    use crate::notification::MemoryAccountDirectory;
    use crate::pipeline::tests::pipeline_with;

    #[tokio::test]
    async fn test_stops_on_shutdown() {
        let directory = Arc::new(MemoryAccountDirectory::new());
        let pipeline = pipeline_with(directory.clone(), Arc::new(MemoryInboxBackend::new()));
        let independence = Arc::new(IndependenceService::new(
            IndependenceRules::default(),
            Arc::new(MemoryIndependenceStore::new()),
            directory,
            pipeline,
        ));
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(IndependenceEvaluator::new(3600, independence, rx).run());

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(()).unwrap();

        let joined = tokio::time::timeout(Duration::from_secs(2), handle).await;
        tokio_test::assert_ok!(joined).unwrap();
    }
}

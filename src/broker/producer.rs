use std::sync::Arc;
use std::time::Duration;

use tracing::instrument;

use crate::error::NotifyError;
use crate::metrics::BrokerMetrics;
use crate::resilience::{BackoffConfig, ExponentialBackoff};

use super::backend::{AppendOutcome, BrokerBackend};
use super::envelope::EventEnvelope;
use super::topics::{partition_for, Topic};

/// Result of a successful publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub topic: Topic,
    pub partition: u32,
    pub outcome: AppendOutcome,
}

impl PublishReceipt {
    pub fn is_duplicate(&self) -> bool {
        self.outcome == AppendOutcome::Duplicate
    }
}

/// Publishes envelopes to the partition owned by their subject.
pub struct EventProducer {
    backend: Arc<dyn BrokerBackend>,
    partitions: u32,
    dedup_window: Duration,
    retry: BackoffConfig,
}

impl EventProducer {
    pub fn new(
        backend: Arc<dyn BrokerBackend>,
        partitions: u32,
        dedup_window: Duration,
        retry: BackoffConfig,
    ) -> Self {
        Self {
            backend,
            partitions: partitions.max(1),
            dedup_window,
            retry,
        }
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    pub fn backend(&self) -> &Arc<dyn BrokerBackend> {
        &self.backend
    }

    /// Validate, partition and append. Transient failures are retried with
    /// bounded backoff; whatever is left is returned to the caller.
    #[instrument(
        skip(self, envelope),
        fields(event_id = %envelope.id, event_type = %envelope.event_type, topic = %topic)
    )]
    pub async fn publish(
        &self,
        topic: Topic,
        envelope: &EventEnvelope,
    ) -> Result<PublishReceipt, NotifyError> {
        envelope.validate()?;

        let partition = partition_for(&envelope.subject_user_id, self.partitions);
        let mut backoff = ExponentialBackoff::with_config(self.retry.clone());

        loop {
            match self
                .backend
                .append(topic, partition, envelope, self.dedup_window)
                .await
            {
                Ok(outcome) => {
                    let label = match outcome {
                        AppendOutcome::Appended { .. } => "appended",
                        AppendOutcome::Duplicate => "duplicate",
                    };
                    BrokerMetrics::record_published(topic.stream_name(), label);
                    tracing::debug!(partition, outcome = label, "Envelope published");
                    return Ok(PublishReceipt {
                        topic,
                        partition,
                        outcome,
                    });
                }
                Err(e) if e.is_transient() => match backoff.next_delay() {
                    Some(delay) => {
                        BrokerMetrics::record_retry();
                        tracing::warn!(
                            error = %e,
                            attempt = backoff.attempt(),
                            delay_ms = delay.as_millis() as u64,
                            "Publish failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        BrokerMetrics::record_published(topic.stream_name(), "failed");
                        tracing::error!(error = %e, attempts = backoff.attempt(), "Publish retries exhausted");
                        return Err(NotifyError::TransientBroker {
                            attempts: backoff.attempt(),
                            message: e.to_string(),
                        });
                    }
                },
                Err(e) => {
                    BrokerMetrics::record_published(topic.stream_name(), "failed");
                    tracing::error!(error = %e, "Publish rejected by broker");
                    return Err(NotifyError::Broker(e));
                }
            }
        }
    }
}

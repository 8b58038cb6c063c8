//! Consumer-group client and the long-lived consumer loop.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::instrument;

use crate::error::NotifyError;
use crate::metrics::BrokerMetrics;
use crate::resilience::{BackoffConfig, ExponentialBackoff};

use super::backend::{BrokerBackend, BrokerError, BrokerRecord, ReadCursor, RecordPosition};
use super::envelope::{EnvelopeError, EventEnvelope};
use super::topics::Topic;

/// What a consumer does with a record it cannot handle. There is no default:
/// every consumer group states its choice in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop the loop without committing the failed record
    HaltOnError,
    /// Commit the failed record and move on
    SkipAndContinue,
}

/// Business logic run for each consumed envelope.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), NotifyError>;
}

/// A record read from the broker, decoded and validated at the boundary.
#[derive(Debug, Clone)]
pub struct ConsumedRecord {
    pub position: RecordPosition,
    pub envelope: Result<EventEnvelope, EnvelopeError>,
}

impl From<BrokerRecord> for ConsumedRecord {
    fn from(record: BrokerRecord) -> Self {
        let envelope = record.decode();
        Self {
            position: record.position,
            envelope,
        }
    }
}

/// Reads consumer-group streams across every partition of a set of topics.
#[derive(Clone)]
pub struct BrokerClient {
    backend: Arc<dyn BrokerBackend>,
    partitions: u32,
    poll_interval: Duration,
}

impl BrokerClient {
    pub fn new(backend: Arc<dyn BrokerBackend>, partitions: u32, poll_interval: Duration) -> Self {
        Self {
            backend,
            partitions: partitions.max(1),
            poll_interval,
        }
    }

    /// At-least-once stream of records. This consumer's uncommitted entries
    /// come first, then new entries in per-partition order. The stream ends
    /// on the first broker error; reopening it redelivers whatever was not
    /// committed.
    pub fn consume(
        &self,
        topics: &[Topic],
        group: &str,
        consumer: &str,
        batch_size: usize,
    ) -> BoxStream<'static, Result<ConsumedRecord, BrokerError>> {
        let backend = self.backend.clone();
        let partitions = self.partitions;
        let poll_interval = self.poll_interval;
        let topics = topics.to_vec();
        let group = group.to_string();
        let consumer = consumer.to_string();
        let batch_size = batch_size.max(1);

        Box::pin(async_stream::try_stream! {
            let mut slots = Vec::with_capacity(topics.len() * partitions as usize);
            for topic in &topics {
                for partition in 0..partitions {
                    backend.ensure_group(*topic, partition, &group).await?;
                    slots.push((*topic, partition));
                }
            }

            for (topic, partition) in &slots {
                let mut seen = HashSet::new();
                loop {
                    let batch = backend
                        .read_group(*topic, *partition, &group, &consumer, ReadCursor::Pending, batch_size)
                        .await?;
                    let fresh: Vec<BrokerRecord> = batch
                        .into_iter()
                        .filter(|r| seen.insert(r.position.record_id.clone()))
                        .collect();
                    if fresh.is_empty() {
                        break;
                    }
                    tracing::info!(
                        topic = %topic,
                        partition = *partition,
                        count = fresh.len(),
                        "Redelivering pending records"
                    );
                    for record in fresh {
                        yield ConsumedRecord::from(record);
                    }
                }
            }

            loop {
                let mut idle = true;
                for (topic, partition) in &slots {
                    let batch = backend
                        .read_group(*topic, *partition, &group, &consumer, ReadCursor::New, batch_size)
                        .await?;
                    if !batch.is_empty() {
                        idle = false;
                    }
                    for record in batch {
                        yield ConsumedRecord::from(record);
                    }
                }
                if idle {
                    tokio::time::sleep(poll_interval).await;
                }
            }
        })
    }

    pub async fn commit(&self, group: &str, position: &RecordPosition) -> Result<(), BrokerError> {
        self.backend.commit(group, position).await
    }

    /// Apply each topic's retention to all of its partitions.
    pub async fn trim_expired(&self, topics: &[Topic]) -> Result<u64, BrokerError> {
        let now = chrono::Utc::now();
        let mut removed = 0;
        for topic in topics {
            let retention = chrono::Duration::from_std(topic.retention())
                .unwrap_or_else(|_| chrono::Duration::days(7));
            let cutoff = now - retention;
            for partition in 0..self.partitions {
                removed += self.backend.trim_before(*topic, partition, cutoff).await?;
            }
        }
        Ok(removed)
    }

    pub async fn is_healthy(&self) -> bool {
        self.backend.health_check().await
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub group: String,
    pub consumer: String,
    pub topics: Vec<Topic>,
    pub batch_size: usize,
    pub failure_policy: FailurePolicy,
    /// Backoff used to reopen the stream after broker errors
    pub reconnect: BackoffConfig,
}

/// Why a consumer loop returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerExit {
    Shutdown,
    /// `halt_on_error` stopped on an unhandled record, left uncommitted
    Halted { record_id: String, reason: String },
    BrokerUnavailable { attempts: u32, message: String },
}

enum Step {
    Continue,
    Reconnect(BrokerError),
    Exit(ConsumerExit),
}

/// One long-lived loop per consumer group.
pub struct EventConsumer {
    client: BrokerClient,
    handler: Arc<dyn EnvelopeHandler>,
    options: ConsumerOptions,
}

impl EventConsumer {
    pub fn new(
        client: BrokerClient,
        handler: Arc<dyn EnvelopeHandler>,
        options: ConsumerOptions,
    ) -> Self {
        Self {
            client,
            handler,
            options,
        }
    }

    /// Consume until shutdown, a halting failure, or the broker stays down
    /// past the reconnect budget. A record being handled when shutdown
    /// arrives is finished and committed first.
    #[instrument(
        skip(self, shutdown),
        fields(group = %self.options.group, consumer = %self.options.consumer)
    )]
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> ConsumerExit {
        let mut backoff = ExponentialBackoff::with_config(self.options.reconnect.clone());

        tracing::info!(
            topics = ?self.options.topics,
            failure_policy = ?self.options.failure_policy,
            "Event consumer started"
        );

        'reconnect: loop {
            let mut stream = self.client.consume(
                &self.options.topics,
                &self.options.group,
                &self.options.consumer,
                self.options.batch_size,
            );

            let error = loop {
                let next = tokio::select! {
                    biased;
                    _ = shutdown.recv() => {
                        tracing::info!("Event consumer received shutdown signal");
                        return ConsumerExit::Shutdown;
                    }
                    item = stream.next() => item,
                };

                let record = match next {
                    Some(Ok(record)) => record,
                    Some(Err(e)) => break e,
                    None => break BrokerError::Connection("stream ended".into()),
                };

                match self.process(record).await {
                    Step::Continue => backoff.reset(),
                    Step::Reconnect(e) => break e,
                    Step::Exit(exit) => return exit,
                }
            };

            match backoff.next_delay() {
                Some(delay) => {
                    tracing::warn!(
                        error = %error,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        "Broker read failed, reopening stream"
                    );
                    tokio::select! {
                        _ = shutdown.recv() => return ConsumerExit::Shutdown,
                        _ = tokio::time::sleep(delay) => continue 'reconnect,
                    }
                }
                None => {
                    tracing::error!(error = %error, "Broker unavailable, consumer stopping");
                    return ConsumerExit::BrokerUnavailable {
                        attempts: backoff.attempt(),
                        message: error.to_string(),
                    };
                }
            }
        }
    }

    async fn process(&self, record: ConsumedRecord) -> Step {
        let topic = record.position.topic.stream_name();
        let record_id = record.position.record_id.clone();

        let outcome = match &record.envelope {
            Err(e) => {
                tracing::warn!(record_id = %record_id, error = %e, "Malformed envelope");
                self.on_failure(&record, "malformed", e.to_string())
            }
            Ok(envelope) => {
                let start = Instant::now();
                let result = self.handler.handle(envelope).await;
                BrokerMetrics::record_handler_latency(start.elapsed().as_secs_f64());

                match result {
                    Ok(()) => Ok("handled"),
                    Err(e) if e.is_resolved() => {
                        tracing::info!(
                            event_id = %envelope.id,
                            error = %e,
                            kind = e.kind(),
                            "Envelope resolved without delivery"
                        );
                        Ok("resolved")
                    }
                    Err(e) => {
                        tracing::error!(
                            event_id = %envelope.id,
                            event_type = %envelope.event_type,
                            error = %e,
                            "Envelope handler failed"
                        );
                        self.on_failure(&record, "failed", e.to_string())
                    }
                }
            }
        };

        let label = match outcome {
            Ok(label) => label,
            Err(exit) => {
                BrokerMetrics::record_consumed(topic, "halted");
                return Step::Exit(exit);
            }
        };

        if let Err(e) = self.client.commit(&self.options.group, &record.position).await {
            return Step::Reconnect(e);
        }
        BrokerMetrics::record_consumed(topic, label);
        Step::Continue
    }

    fn on_failure(
        &self,
        record: &ConsumedRecord,
        label: &'static str,
        reason: String,
    ) -> Result<&'static str, ConsumerExit> {
        match self.options.failure_policy {
            FailurePolicy::SkipAndContinue => Ok(if label == "malformed" {
                "skipped_malformed"
            } else {
                "skipped"
            }),
            FailurePolicy::HaltOnError => Err(ConsumerExit::Halted {
                record_id: record.position.record_id.clone(),
                reason,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::broker::{partition_for, EventProducer, MemoryBrokerBackend};

    const GROUP: &str = "test-group";

    struct CountingHandler {
        handled: AtomicUsize,
        fail_type: Option<&'static str>,
    }

    #[async_trait]
    impl EnvelopeHandler for CountingHandler {
        async fn handle(&self, envelope: &EventEnvelope) -> Result<(), NotifyError> {
            if Some(envelope.event_type.as_str()) == self.fail_type {
                return Err(NotifyError::Inbox(crate::inbox::InboxError::Storage(
                    "down".into(),
                )));
            }
            if envelope.event_type == "bogus.event" {
                return Err(NotifyError::UnknownEventType(envelope.event_type.clone()));
            }
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn options(policy: FailurePolicy) -> ConsumerOptions {
        ConsumerOptions {
            group: GROUP.into(),
            consumer: "c1".into(),
            topics: vec![Topic::Social],
            batch_size: 16,
            failure_policy: policy,
            reconnect: BackoffConfig {
                initial_delay_ms: 1,
                max_delay_ms: 5,
                multiplier: 2.0,
                jitter_factor: 0.0,
                max_attempts: Some(2),
            },
        }
    }

    fn setup() -> (Arc<MemoryBrokerBackend>, BrokerClient, EventProducer) {
        let backend = Arc::new(MemoryBrokerBackend::new());
        let client = BrokerClient::new(backend.clone(), 2, Duration::from_millis(5));
        let producer = EventProducer::new(
            backend.clone(),
            2,
            Duration::from_secs(60),
            BackoffConfig::default(),
        );
        (backend, client, producer)
    }

    async fn publish(producer: &EventProducer, event_type: &str) -> EventEnvelope {
        let envelope = EventEnvelope::new(event_type, "test", "user-1", json!({}));
        producer.publish(Topic::Social, &envelope).await.unwrap();
        envelope
    }

    #[tokio::test]
    async fn test_consume_commits_handled_records() {
        let (backend, client, producer) = setup();
        publish(&producer, "post.liked").await;
        publish(&producer, "bogus.event").await;

        let handler = Arc::new(CountingHandler {
            handled: AtomicUsize::new(0),
            fail_type: None,
        });
        let consumer = EventConsumer::new(
            client,
            handler.clone(),
            options(FailurePolicy::HaltOnError),
        );

        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(consumer.run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();

        assert_eq!(task.await.unwrap(), ConsumerExit::Shutdown);
        assert_eq!(handler.handled.load(Ordering::SeqCst), 1);
        let partition = partition_for("user-1", 2);
        // Unknown event types are resolved, so both are committed
        assert_eq!(backend.pending_len(Topic::Social, partition, GROUP), 0);
    }

    #[tokio::test]
    async fn test_halt_on_error_leaves_record_pending() {
        let (backend, client, producer) = setup();
        publish(&producer, "comment.created").await;

        let handler = Arc::new(CountingHandler {
            handled: AtomicUsize::new(0),
            fail_type: Some("comment.created"),
        });
        let consumer = EventConsumer::new(client, handler, options(FailurePolicy::HaltOnError));
        let (_tx, rx) = broadcast::channel(1);

        let exit = consumer.run(rx).await;
        assert!(matches!(exit, ConsumerExit::Halted { .. }));
        let partition = partition_for("user-1", 2);
        assert_eq!(backend.pending_len(Topic::Social, partition, GROUP), 1);
    }

    #[tokio::test]
    async fn test_skip_and_continue_commits_failures() {
        let (backend, client, producer) = setup();
        publish(&producer, "comment.created").await;
        publish(&producer, "post.liked").await;
        backend.append_raw(Topic::Social, 0, "{ not json");

        let handler = Arc::new(CountingHandler {
            handled: AtomicUsize::new(0),
            fail_type: Some("comment.created"),
        });
        let consumer = EventConsumer::new(
            client,
            handler.clone(),
            options(FailurePolicy::SkipAndContinue),
        );
        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(consumer.run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();
        task.await.unwrap();

        assert_eq!(handler.handled.load(Ordering::SeqCst), 1);
        assert_eq!(backend.pending_len(Topic::Social, 0, GROUP), 0);
        assert_eq!(backend.pending_len(Topic::Social, 1, GROUP), 0);
    }

    #[tokio::test]
    async fn test_trim_expired_keeps_recent_records() {
        let (backend, client, producer) = setup();
        publish(&producer, "post.liked").await;

        let removed = client.trim_expired(&Topic::ALL).await.unwrap();
        assert_eq!(removed, 0);
        assert_eq!(backend.total_records(), 1);
    }

    #[tokio::test]
    async fn test_pending_records_are_redelivered_first() {
        let (backend, client, producer) = setup();
        let envelope = publish(&producer, "post.liked").await;
        let partition = partition_for("user-1", 2);

        // First reader takes the record but never commits it
        backend.ensure_group(Topic::Social, partition, GROUP).await.unwrap();
        let taken = backend
            .read_group(Topic::Social, partition, GROUP, "c1", ReadCursor::New, 10)
            .await
            .unwrap();
        assert_eq!(taken.len(), 1);

        let mut stream = client.consume(&[Topic::Social], GROUP, "c1", 10);
        let redelivered = stream.next().await.unwrap().unwrap();
        assert_eq!(redelivered.envelope.unwrap().id, envelope.id);
    }
}

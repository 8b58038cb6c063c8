//! Storage abstraction behind the producer and consumer.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::envelope::{EnvelopeError, EventEnvelope};
use super::topics::Topic;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Connection-level failure; retrying may succeed
    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error("append acknowledged by {acked} of {required} replicas")]
    UnderReplicated { acked: u32, required: u32 },

    #[error("broker command failed: {0}")]
    Command(String),

    #[error("invalid envelope: {0}")]
    Envelope(#[from] EnvelopeError),
}

impl BrokerError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Connection(_) | BrokerError::UnderReplicated { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended { record_id: String },
    /// The envelope id was already published within the dedup window
    Duplicate,
}

/// Where a record lives, used to commit it once handled.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordPosition {
    pub topic: Topic,
    pub partition: u32,
    pub record_id: String,
}

/// Raw record as read from a stream. Decoding is deferred so that a
/// malformed entry can still be committed or skipped by position.
#[derive(Debug, Clone)]
pub struct BrokerRecord {
    pub position: RecordPosition,
    pub body: Option<String>,
}

impl BrokerRecord {
    pub fn decode(&self) -> Result<EventEnvelope, EnvelopeError> {
        match &self.body {
            Some(body) => EventEnvelope::decode(body),
            None => Err(EnvelopeError::MissingField(super::envelope::FIELD_ENVELOPE)),
        }
    }
}

/// Which slice of a consumer group's stream to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCursor {
    /// Entries delivered to this consumer but never committed
    Pending,
    /// Entries never delivered to the group
    New,
}

#[async_trait]
pub trait BrokerBackend: Send + Sync {
    /// Append unless the envelope id was seen within `dedup_window`.
    async fn append(
        &self,
        topic: Topic,
        partition: u32,
        envelope: &EventEnvelope,
        dedup_window: Duration,
    ) -> Result<AppendOutcome, BrokerError>;

    /// Create the consumer group for a partition if it does not exist.
    async fn ensure_group(&self, topic: Topic, partition: u32, group: &str)
        -> Result<(), BrokerError>;

    /// Non-blocking read; callers poll.
    async fn read_group(
        &self,
        topic: Topic,
        partition: u32,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
    ) -> Result<Vec<BrokerRecord>, BrokerError>;

    async fn commit(&self, group: &str, position: &RecordPosition) -> Result<(), BrokerError>;

    /// Drop records older than `cutoff`. Returns how many were removed.
    async fn trim_before(
        &self,
        topic: Topic,
        partition: u32,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, BrokerError>;

    async fn health_check(&self) -> bool;

    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BrokerError::Connection("reset".into()).is_transient());
        assert!(BrokerError::UnderReplicated {
            acked: 0,
            required: 1
        }
        .is_transient());
        assert!(!BrokerError::Command("WRONGTYPE".into()).is_transient());
    }

    #[test]
    fn test_record_without_body_fails_decode() {
        let record = BrokerRecord {
            position: RecordPosition {
                topic: Topic::Social,
                partition: 0,
                record_id: "1-0".into(),
            },
            body: None,
        };
        assert!(matches!(
            record.decode(),
            Err(EnvelopeError::MissingField("envelope"))
        ));
    }
}

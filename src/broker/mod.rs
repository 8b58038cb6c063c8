//! Event envelope and broker client.
//!
//! Producers publish [`EventEnvelope`]s to a [`Topic`]; the broker keeps one
//! stream per `(topic, partition)` and the [`EventConsumer`] feeds them to an
//! [`EnvelopeHandler`] at least once, committing only after success.

mod backend;
mod consumer;
mod envelope;
mod factory;
mod memory_backend;
mod producer;
mod redis_backend;
mod topics;

pub use backend::{
    AppendOutcome, BrokerBackend, BrokerError, BrokerRecord, ReadCursor, RecordPosition,
};
pub use consumer::{
    BrokerClient, ConsumedRecord, ConsumerExit, ConsumerOptions, EnvelopeHandler, EventConsumer,
    FailurePolicy,
};
pub use envelope::{EnvelopeError, EnvelopeHeaders, EventEnvelope, SCHEMA_VERSION};
pub use factory::{consumer_options, create_broker_backend, create_client, create_producer};
pub use memory_backend::MemoryBrokerBackend;
pub use producer::{EventProducer, PublishReceipt};
pub use redis_backend::RedisBrokerBackend;
pub use topics::{fnv1a, partition_for, Topic};

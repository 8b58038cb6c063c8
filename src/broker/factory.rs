//! Broker backend factory

use std::sync::Arc;
use std::time::Duration;

use crate::config::BrokerConfig;
use crate::redis::RedisPool;
use crate::resilience::BackoffConfig;

use super::backend::BrokerBackend;
use super::consumer::{BrokerClient, ConsumerOptions};
use super::memory_backend::MemoryBrokerBackend;
use super::producer::EventProducer;
use super::redis_backend::RedisBrokerBackend;

/// Create a broker backend based on configuration.
///
/// - `"redis"`: Redis Streams, if a pool is provided
/// - `"memory"` (default): in-process streams for tests and single-node runs
pub fn create_broker_backend(
    settings: &BrokerConfig,
    redis_pool: Option<Arc<RedisPool>>,
) -> Arc<dyn BrokerBackend> {
    match settings.backend.as_str() {
        "redis" => {
            if let Some(pool) = redis_pool {
                tracing::info!(
                    backend = "redis",
                    prefix = %settings.stream_prefix,
                    partitions = settings.partitions,
                    min_replicas = settings.min_replicas,
                    "Creating Redis Streams broker backend"
                );
                Arc::new(RedisBrokerBackend::new(
                    pool,
                    settings.stream_prefix.clone(),
                    settings.min_replicas,
                    Duration::from_millis(settings.replication_timeout_ms),
                ))
            } else {
                tracing::warn!("Redis broker requested but no pool provided, falling back to memory");
                Arc::new(MemoryBrokerBackend::new())
            }
        }
        _ => {
            tracing::info!(backend = "memory", "Creating in-memory broker backend");
            Arc::new(MemoryBrokerBackend::new())
        }
    }
}

pub fn create_producer(settings: &BrokerConfig, backend: Arc<dyn BrokerBackend>) -> EventProducer {
    EventProducer::new(
        backend,
        settings.partitions,
        Duration::from_secs(settings.dedup_window_secs),
        BackoffConfig::from(&settings.retry),
    )
}

pub fn create_client(settings: &BrokerConfig, backend: Arc<dyn BrokerBackend>) -> BrokerClient {
    BrokerClient::new(
        backend,
        settings.partitions,
        Duration::from_millis(settings.consumer.poll_interval_ms),
    )
}

pub fn consumer_options(settings: &BrokerConfig) -> ConsumerOptions {
    let consumer = &settings.consumer;
    ConsumerOptions {
        group: consumer.group.clone(),
        consumer: settings.consumer_name(),
        topics: consumer.topics.clone(),
        batch_size: consumer.batch_size,
        failure_policy: consumer.failure_policy,
        reconnect: BackoffConfig {
            initial_delay_ms: settings.retry.base_delay_ms,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: Some(consumer.reconnect_attempts.max(1)),
        },
    }
}

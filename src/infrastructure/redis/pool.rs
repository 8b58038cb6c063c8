//! Shared multiplexed Redis connection with circuit breaker integration.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError, RedisResult};
use tokio::sync::RwLock;

use crate::config::RedisConfig;
use crate::resilience::{CircuitBreaker, CircuitState};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Circuit breaker is open")]
    CircuitOpen,
}

impl PoolError {
    /// Connection-level failures that may succeed on retry
    pub fn is_transient(&self) -> bool {
        match self {
            PoolError::CircuitOpen => true,
            PoolError::Redis(e) => {
                e.is_connection_dropped()
                    || e.is_io_error()
                    || e.is_timeout()
                    || e.is_connection_refusal()
                    || e.kind() == redis::ErrorKind::TryAgain
                    || e.kind() == redis::ErrorKind::BusyLoadingError
                    || e.kind() == redis::ErrorKind::ClusterDown
            }
        }
    }
}

/// One multiplexed connection shared by every task. Redis pipelines commands
/// on it, so cloning the handle is cheap and needs no extra locking.
pub struct RedisPool {
    client: Client,
    connection: RwLock<Option<MultiplexedConnection>>,
    circuit_breaker: Arc<CircuitBreaker>,
    connected: AtomicBool,
    reconnects: AtomicU32,
    url: String,
}

impl RedisPool {
    pub fn new(config: &RedisConfig, circuit_breaker: Arc<CircuitBreaker>) -> Result<Self, PoolError> {
        let client = Client::open(config.url.as_str())?;

        Ok(Self {
            client,
            connection: RwLock::new(None),
            circuit_breaker,
            connected: AtomicBool::new(false),
            reconnects: AtomicU32::new(0),
            url: config.url.clone(),
        })
    }

    pub async fn get_connection(&self) -> Result<MultiplexedConnection, PoolError> {
        if !self.circuit_breaker.allow_request() {
            return Err(PoolError::CircuitOpen);
        }

        {
            let conn = self.connection.read().await;
            if let Some(ref c) = *conn {
                return Ok(c.clone());
            }
        }

        self.connect().await
    }

    async fn connect(&self) -> Result<MultiplexedConnection, PoolError> {
        let mut guard = self.connection.write().await;

        // Another task may have connected while we waited for the lock
        if let Some(ref c) = *guard {
            return Ok(c.clone());
        }

        match self.client.get_multiplexed_tokio_connection().await {
            Ok(conn) => {
                *guard = Some(conn.clone());
                self.circuit_breaker.record_success();
                if !self.connected.swap(true, Ordering::AcqRel) {
                    self.reconnects.fetch_add(1, Ordering::AcqRel);
                }
                tracing::info!("Redis connection established");
                Ok(conn)
            }
            Err(e) => {
                self.circuit_breaker.record_failure();
                self.connected.store(false, Ordering::Release);
                tracing::error!(error = %e, "Failed to connect to Redis");
                Err(PoolError::Redis(e))
            }
        }
    }

    /// Run a command against the shared connection, recording the outcome on
    /// the circuit breaker and dropping the connection on I/O failures.
    pub async fn execute<F, T, Fut>(&self, f: F) -> Result<T, PoolError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: std::future::Future<Output = RedisResult<T>>,
    {
        let conn = self.get_connection().await?;

        match f(conn).await {
            Ok(result) => {
                self.circuit_breaker.record_success();
                Ok(result)
            }
            Err(e) => {
                if e.is_connection_dropped() || e.is_io_error() {
                    let mut guard = self.connection.write().await;
                    *guard = None;
                    self.connected.store(false, Ordering::Release);
                }
                // Server-side errors (BUSYGROUP, WRONGTYPE) say nothing about health
                if e.is_connection_dropped() || e.is_io_error() || e.is_timeout() {
                    self.circuit_breaker.record_failure();
                }
                Err(PoolError::Redis(e))
            }
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.connected.load(Ordering::Acquire) && self.circuit_breaker.state() == CircuitState::Closed
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.state()
    }

    pub fn total_connects(&self) -> u32 {
        self.reconnects.load(Ordering::Acquire)
    }

    /// URL with the password masked
    pub fn url_masked(&self) -> String {
        crate::postgres::mask_url(&self.url)
    }

    pub async fn ping(&self) -> Result<(), PoolError> {
        self.execute(|mut conn| async move {
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }
}

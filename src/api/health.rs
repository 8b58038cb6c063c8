//! Health check and statistics endpoints.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::inbox::InboxStats;
use crate::presence::PresenceStats;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub broker: BrokerHealthResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisHealthResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postgres: Option<PostgresHealthResponse>,
    pub presence: PresenceStats,
}

#[derive(Debug, Serialize)]
pub struct BrokerHealthResponse {
    pub backend: String,
    pub healthy: bool,
}

#[derive(Debug, Serialize)]
pub struct RedisHealthResponse {
    pub connected: bool,
    pub circuit_breaker_state: String,
    pub total_connects: u32,
}

#[derive(Debug, Serialize)]
pub struct PostgresHealthResponse {
    pub connected: bool,
    pub pool_size: u32,
    pub idle_connections: u32,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub presence: PresenceStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inbox: Option<InboxStats>,
    pub approvals: ApprovalStats,
    pub independence: IndependenceStats,
    pub directory_backend: String,
    pub registered_event_types: usize,
}

#[derive(Debug, Serialize)]
pub struct IndependenceStats {
    pub backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profiles: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ApprovalStats {
    pub backend: String,
    pub window_hours: i64,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let broker_healthy = state.broker.is_healthy().await;

    let redis = state.redis_pool.as_ref().map(|pool| RedisHealthResponse {
        connected: pool.is_healthy(),
        circuit_breaker_state: pool.circuit_state().as_str().to_string(),
        total_connects: pool.total_connects(),
    });

    let postgres = state.postgres_pool.as_ref().map(|pool| {
        let inner_pool = pool.pool();
        PostgresHealthResponse {
            connected: pool.is_available(),
            pool_size: inner_pool.size(),
            idle_connections: inner_pool.num_idle() as u32,
        }
    });

    let storage_ok = postgres.as_ref().map(|p| p.connected).unwrap_or(true);
    let status = if broker_healthy && storage_ok {
        "healthy"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        broker: BrokerHealthResponse {
            backend: state.broker.backend_name().to_string(),
            healthy: broker_healthy,
        },
        redis,
        postgres,
        presence: state.presence.stats(),
    })
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let inbox = match state.inbox.stats().await {
        Ok(stats) => Some(stats),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read inbox stats");
            None
        }
    };

    let profiles = match state.independence.count().await {
        Ok(count) => Some(count),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to count independence profiles");
            None
        }
    };

    Json(StatsResponse {
        presence: state.presence.stats(),
        inbox,
        approvals: ApprovalStats {
            backend: state.approvals.store().name().to_string(),
            window_hours: state.approvals.policy().window.num_hours(),
        },
        independence: IndependenceStats {
            backend: state.independence.store_name().to_string(),
            profiles,
        },
        directory_backend: state.directory.name().to_string(),
        registered_event_types: state.engine.registry().len(),
    })
}

//! Prometheus metrics for the notification pipeline.
//!
//! Grouped by component:
//! - Broker publish/consume outcomes and retry counts
//! - Policy engine output, unknown types and kid-safety rejections
//! - Inbox writes and retention sweeps
//! - Presence sessions, pushes and evictions
//! - Channel dispatch, guardian approvals and independence transitions

mod helpers;

pub use helpers::{
    encode_metrics, BrokerMetrics, DispatchMetrics, GuardianMetrics, InboxMetrics,
    PolicyMetrics, PresenceMetrics, WsMessageMetrics,
};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "haven";

lazy_static! {
    // ============================================================================
    // Broker Metrics
    // ============================================================================

    /// Publish attempts by topic and outcome (appended, duplicate, failed)
    pub static ref BROKER_PUBLISHED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_broker_published_total", METRIC_PREFIX),
        "Envelopes published by topic and outcome",
        &["topic", "outcome"]
    ).unwrap();

    pub static ref BROKER_PUBLISH_RETRIES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_broker_publish_retries_total", METRIC_PREFIX),
        "Publish retries after transient broker failures"
    ).unwrap();

    /// Consumed records by topic and outcome (processed, resolved, skipped, invalid)
    pub static ref BROKER_CONSUMED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_broker_consumed_total", METRIC_PREFIX),
        "Records consumed by topic and outcome",
        &["topic", "outcome"]
    ).unwrap();

    pub static ref BROKER_HANDLER_LATENCY: Histogram = register_histogram!(
        format!("{}_broker_handler_latency_seconds", METRIC_PREFIX),
        "Time spent handling one consumed envelope",
        vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();

    // ============================================================================
    // Policy Metrics
    // ============================================================================

    pub static ref POLICY_NOTIFICATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_policy_notifications_total", METRIC_PREFIX),
        "Notifications produced by the policy engine",
        &["type"]
    ).unwrap();

    pub static ref POLICY_UNKNOWN_EVENTS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_policy_unknown_events_total", METRIC_PREFIX),
        "Envelopes dropped because no builder is registered"
    ).unwrap();

    pub static ref KID_SAFETY_VIOLATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_kid_safety_violations_total", METRIC_PREFIX),
        "Notifications withheld from minor accounts",
        &["reason"]
    ).unwrap();

    // ============================================================================
    // Inbox Metrics
    // ============================================================================

    pub static ref INBOX_INSERTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_inbox_inserts_total", METRIC_PREFIX),
        "Inbox inserts by outcome (stored, duplicate, failed)",
        &["outcome"]
    ).unwrap();

    pub static ref INBOX_SYNCED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_inbox_synced_total", METRIC_PREFIX),
        "Notifications handed out through sync pulls"
    ).unwrap();

    pub static ref INBOX_EXPIRED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_inbox_expired_total", METRIC_PREFIX),
        "Notifications deleted by the retention sweep"
    ).unwrap();

    // ============================================================================
    // Presence Metrics
    // ============================================================================

    pub static ref PRESENCE_SESSIONS: IntGauge = register_int_gauge!(
        format!("{}_presence_sessions", METRIC_PREFIX),
        "Currently registered sessions"
    ).unwrap();

    pub static ref PRESENCE_USERS_ONLINE: IntGauge = register_int_gauge!(
        format!("{}_presence_users_online", METRIC_PREFIX),
        "Users with at least one session"
    ).unwrap();

    pub static ref PRESENCE_PUSHES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_presence_pushes_total", METRIC_PREFIX),
        "Real-time pushes by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref PRESENCE_EVICTIONS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_presence_evictions_total", METRIC_PREFIX),
        "Sessions evicted by the liveness sweep"
    ).unwrap();

    pub static ref WS_CONNECTIONS_OPENED: IntCounter = register_int_counter!(
        format!("{}_ws_connections_opened_total", METRIC_PREFIX),
        "WebSocket connections opened"
    ).unwrap();

    pub static ref WS_CONNECTIONS_CLOSED: IntCounter = register_int_counter!(
        format!("{}_ws_connections_closed_total", METRIC_PREFIX),
        "WebSocket connections closed"
    ).unwrap();

    pub static ref WS_MESSAGES_RECEIVED: IntCounterVec = register_int_counter_vec!(
        format!("{}_ws_messages_received_total", METRIC_PREFIX),
        "Client messages received by type",
        &["type"]
    ).unwrap();

    pub static ref WS_CONNECTION_DURATION: Histogram = register_histogram!(
        format!("{}_ws_connection_duration_seconds", METRIC_PREFIX),
        "WebSocket connection lifetime",
        vec![1.0, 10.0, 60.0, 300.0, 900.0, 3600.0, 14400.0]
    ).unwrap();

    // ============================================================================
    // Delivery Metrics
    // ============================================================================

    pub static ref CHANNEL_DISPATCH_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_channel_dispatch_total", METRIC_PREFIX),
        "Secondary channel dispatches by channel and outcome",
        &["channel", "outcome"]
    ).unwrap();

    pub static ref ROUTE_LATENCY: Histogram = register_histogram!(
        format!("{}_route_latency_seconds", METRIC_PREFIX),
        "Time from route() entry to inbox persistence plus real-time push",
        vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
    ).unwrap();

    // ============================================================================
    // Guardian Metrics
    // ============================================================================

    pub static ref APPROVALS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_guardian_approvals_total", METRIC_PREFIX),
        "Guardian approval lifecycle events",
        &["event"]
    ).unwrap();

    pub static ref INDEPENDENCE_TRANSITIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_independence_transitions_total", METRIC_PREFIX),
        "Independence phase changes by target phase",
        &["phase"]
    ).unwrap();
}

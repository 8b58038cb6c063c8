//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use super::{
    APPROVALS_TOTAL, BROKER_CONSUMED_TOTAL, BROKER_HANDLER_LATENCY, BROKER_PUBLISHED_TOTAL,
    BROKER_PUBLISH_RETRIES_TOTAL, CHANNEL_DISPATCH_TOTAL, INBOX_EXPIRED_TOTAL,
    INBOX_INSERTS_TOTAL, INBOX_SYNCED_TOTAL, INDEPENDENCE_TRANSITIONS_TOTAL,
    KID_SAFETY_VIOLATIONS_TOTAL, POLICY_NOTIFICATIONS_TOTAL, POLICY_UNKNOWN_EVENTS_TOTAL,
    PRESENCE_EVICTIONS_TOTAL, PRESENCE_PUSHES_TOTAL, PRESENCE_SESSIONS, PRESENCE_USERS_ONLINE,
    ROUTE_LATENCY, WS_MESSAGES_RECEIVED,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

pub struct BrokerMetrics;

impl BrokerMetrics {
    pub fn record_published(topic: &str, outcome: &str) {
        BROKER_PUBLISHED_TOTAL
            .with_label_values(&[topic, outcome])
            .inc();
    }

    pub fn record_retry() {
        BROKER_PUBLISH_RETRIES_TOTAL.inc();
    }

    pub fn record_consumed(topic: &str, outcome: &str) {
        BROKER_CONSUMED_TOTAL
            .with_label_values(&[topic, outcome])
            .inc();
    }

    pub fn record_handler_latency(latency_secs: f64) {
        BROKER_HANDLER_LATENCY.observe(latency_secs);
    }
}

pub struct PolicyMetrics;

impl PolicyMetrics {
    pub fn record_notification(notification_type: &str) {
        POLICY_NOTIFICATIONS_TOTAL
            .with_label_values(&[notification_type])
            .inc();
    }

    pub fn record_unknown_event() {
        POLICY_UNKNOWN_EVENTS_TOTAL.inc();
    }

    /// `reason` is one of `not_allowed`, `low_safety_score`, `flagged_content`
    pub fn record_violation(reason: &str) {
        KID_SAFETY_VIOLATIONS_TOTAL
            .with_label_values(&[reason])
            .inc();
    }
}

pub struct InboxMetrics;

impl InboxMetrics {
    pub fn record_insert(outcome: &str) {
        INBOX_INSERTS_TOTAL.with_label_values(&[outcome]).inc();
    }

    pub fn record_synced(count: usize) {
        INBOX_SYNCED_TOTAL.inc_by(count as u64);
    }

    pub fn record_expired(count: usize) {
        INBOX_EXPIRED_TOTAL.inc_by(count as u64);
    }
}

pub struct PresenceMetrics;

impl PresenceMetrics {
    pub fn set_sessions(sessions: usize, users: usize) {
        PRESENCE_SESSIONS.set(sessions as i64);
        PRESENCE_USERS_ONLINE.set(users as i64);
    }

    pub fn record_push(delivered: usize, failed: usize) {
        if delivered > 0 {
            PRESENCE_PUSHES_TOTAL
                .with_label_values(&["delivered"])
                .inc_by(delivered as u64);
        }
        if failed > 0 {
            PRESENCE_PUSHES_TOTAL
                .with_label_values(&["failed"])
                .inc_by(failed as u64);
        }
    }

    pub fn record_evictions(count: usize) {
        PRESENCE_EVICTIONS_TOTAL.inc_by(count as u64);
    }

    pub fn record_route_latency(latency_secs: f64) {
        ROUTE_LATENCY.observe(latency_secs);
    }
}

/// Helper struct for WebSocket message metrics
pub struct WsMessageMetrics;

impl WsMessageMetrics {
    pub fn record(message_type: &str) {
        WS_MESSAGES_RECEIVED.with_label_values(&[message_type]).inc();
    }
}

pub struct DispatchMetrics;

impl DispatchMetrics {
    pub fn record_success(channel: &str) {
        CHANNEL_DISPATCH_TOTAL
            .with_label_values(&[channel, "success"])
            .inc();
    }

    pub fn record_failure(channel: &str) {
        CHANNEL_DISPATCH_TOTAL
            .with_label_values(&[channel, "failure"])
            .inc();
    }
}

pub struct GuardianMetrics;

impl GuardianMetrics {
    /// `event` is one of `opened`, `approved`, `denied`, `expired`
    pub fn record_approval(event: &str) {
        APPROVALS_TOTAL.with_label_values(&[event]).inc();
    }

    pub fn record_phase_change(phase: &str) {
        INDEPENDENCE_TRANSITIONS_TOTAL
            .with_label_values(&[phase])
            .inc();
    }
}

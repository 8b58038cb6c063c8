use std::collections::HashMap;
use std::env;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::broker::{FailurePolicy, Topic};
use crate::guardian::DefaultOutcome;
use crate::notification::NotificationType;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerConfig,
    pub jwt: JwtConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    pub broker: BrokerConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub messaging: MessagingConfig,
    #[serde(default)]
    pub inbox: InboxConfig,
    #[serde(default)]
    pub guardian: GuardianConfig,
    #[serde(default)]
    pub independence: IndependenceConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub otel: OtelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfig {
    /// Shared key for service-to-service endpoints. Unset means open (development only).
    pub key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres URL; required when any backend is `postgres`
    pub url: Option<String>,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u32,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u32,
}

/// Broker client settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// `memory` or `redis`
    #[serde(default = "default_memory_backend")]
    pub backend: String,
    #[serde(default = "default_partitions")]
    pub partitions: u32,
    #[serde(default = "default_stream_prefix")]
    pub stream_prefix: String,
    /// How long a published envelope id is remembered for producer dedup
    #[serde(default = "default_dedup_window")]
    pub dedup_window_secs: u64,
    /// Replicas that must acknowledge an append before publish returns
    #[serde(default)]
    pub min_replicas: u32,
    #[serde(default = "default_replication_timeout")]
    pub replication_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    pub consumer: ConsumerSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_base")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_max")]
    pub max_delay_ms: u64,
}

/// Consumer group settings. `failure_policy` has no default; every
/// deployment must choose one.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerSettings {
    #[serde(default = "default_consumer_group")]
    pub group: String,
    /// Defaults to `{group}-{uuid}`
    pub consumer_name: Option<String>,
    #[serde(default = "default_topics")]
    pub topics: Vec<Topic>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Sleep between polls when every partition is idle
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    pub failure_policy: FailurePolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PresenceConfig {
    /// Heartbeat push interval in seconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Sessions idle longer than this are evicted
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_max_sessions")]
    pub max_sessions_per_user: usize,
    #[serde(default = "default_max_rooms")]
    pub max_rooms_per_session: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboxConfig {
    /// `memory` or `postgres`
    #[serde(default = "default_memory_backend")]
    pub backend: String,
    #[serde(default = "default_sync_limit")]
    pub sync_batch_limit: usize,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
    #[serde(default)]
    pub retention: RetentionConfig,
}

/// Retention per delivery channel, in days
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_in_app_days")]
    pub in_app_days: u32,
    #[serde(default = "default_push_days")]
    pub push_days: u32,
    #[serde(default = "default_long_days")]
    pub email_days: u32,
    #[serde(default = "default_long_days")]
    pub sms_days: u32,
}

/// Account directory storage. Minor flags and guardian links live here.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
    /// `memory` or `postgres`
    #[serde(default = "default_memory_backend")]
    pub backend: String,
}

/// Live conversation state. Messages and unread counters older than the
/// retention window are dropped by the retention task.
#[derive(Debug, Clone, Deserialize)]
pub struct MessagingConfig {
    #[serde(default = "default_message_retention")]
    pub retention_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuardianConfig {
    /// `memory` or `postgres`
    #[serde(default = "default_memory_backend")]
    pub backend: String,
    #[serde(default = "default_approval_window")]
    pub approval_window_hours: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_safety_threshold")]
    pub safety_score_threshold: f64,
    #[serde(default = "default_guardian_visible")]
    pub guardian_visible_types: Vec<NotificationType>,
    /// Outcome applied on expiry, keyed by request type name
    #[serde(default)]
    pub default_outcomes: HashMap<String, DefaultOutcome>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndependenceConfig {
    /// `memory` or `postgres`
    #[serde(default = "default_memory_backend")]
    pub backend: String,
    #[serde(default = "default_evaluation_interval")]
    pub evaluation_interval_secs: u64,
    #[serde(default = "default_warning_days")]
    pub warning_days: i64,
    #[serde(default = "default_preparation_days")]
    pub preparation_days: i64,
    #[serde(default = "default_grace_hours")]
    pub grace_hours: i64,
    #[serde(default = "default_maturity_threshold")]
    pub maturity_threshold: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Provider gateway endpoint for push/email/sms; unset logs instead
    pub webhook_url: Option<String>,
    #[serde(default = "default_dispatch_timeout")]
    pub timeout_secs: u64,
}

/// OpenTelemetry export settings
#[derive(Debug, Clone, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8081
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_pool_size() -> u32 {
    10
}

fn default_connect_timeout() -> u32 {
    5
}

fn default_idle_timeout() -> u32 {
    300
}

fn default_memory_backend() -> String {
    "memory".to_string()
}

fn default_partitions() -> u32 {
    8
}

fn default_stream_prefix() -> String {
    "haven".to_string()
}

fn default_dedup_window() -> u64 {
    86_400 // 24 hours
}

fn default_replication_timeout() -> u64 {
    500
}

fn default_retry_base() -> u64 {
    100
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_max() -> u64 {
    2_000
}

fn default_consumer_group() -> String {
    "notification-policy".to_string()
}

fn default_topics() -> Vec<Topic> {
    Topic::ALL.to_vec()
}

fn default_batch_size() -> usize {
    64
}

fn default_poll_interval() -> u64 {
    200
}

fn default_reconnect_attempts() -> u32 {
    5
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    300 // 5 minutes
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_max_sessions() -> usize {
    5
}

fn default_max_rooms() -> usize {
    100
}

fn default_sync_limit() -> usize {
    100
}

fn default_cleanup_interval() -> u64 {
    3_600
}

fn default_in_app_days() -> u32 {
    30
}

fn default_push_days() -> u32 {
    7
}

fn default_long_days() -> u32 {
    90
}

fn default_message_retention() -> i64 {
    168
}

fn default_approval_window() -> u64 {
    72
}

fn default_safety_threshold() -> f64 {
    0.8
}

fn default_guardian_visible() -> Vec<NotificationType> {
    vec![
        NotificationType::DirectMessage,
        NotificationType::CommentOnOwnPost,
        NotificationType::FollowApproved,
    ]
}

fn default_evaluation_interval() -> u64 {
    3_600
}

fn default_warning_days() -> i64 {
    30
}

fn default_preparation_days() -> i64 {
    7
}

fn default_grace_hours() -> i64 {
    24
}

fn default_maturity_threshold() -> f64 {
    0.75
}

fn default_dispatch_timeout() -> u64 {
    10
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "haven-notification-service".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8081)?
            .set_default("redis.url", "redis://localhost:6379")?
            .set_default("broker.backend", "memory")?
            .set_default("inbox.backend", "memory")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // HAVEN__JWT__SECRET, HAVEN__BROKER__CONSUMER__FAILURE_POLICY, ...
            .add_source(
                Environment::with_prefix("HAVEN")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("server.cors_origins")
                    .with_list_parse_key("broker.consumer.topics")
                    .with_list_parse_key("guardian.guardian_visible_types"),
            );

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl BrokerConfig {
    pub fn consumer_name(&self) -> String {
        self.consumer
            .consumer_name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.consumer.group, uuid::Uuid::new_v4()))
    }
}

impl PresenceConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: vec![],
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            pool_size: default_pool_size(),
            connect_timeout_seconds: default_connect_timeout(),
            idle_timeout_seconds: default_idle_timeout(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_retry_base(),
            max_attempts: default_retry_attempts(),
            max_delay_ms: default_retry_max(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            idle_timeout_secs: default_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval(),
            max_sessions_per_user: default_max_sessions(),
            max_rooms_per_session: default_max_rooms(),
        }
    }
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            backend: default_memory_backend(),
            sync_batch_limit: default_sync_limit(),
            cleanup_interval_secs: default_cleanup_interval(),
            retention: RetentionConfig::default(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            in_app_days: default_in_app_days(),
            push_days: default_push_days(),
            email_days: default_long_days(),
            sms_days: default_long_days(),
        }
    }
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            backend: default_memory_backend(),
            approval_window_hours: default_approval_window(),
            sweep_interval_secs: default_sweep_interval(),
            safety_score_threshold: default_safety_threshold(),
            guardian_visible_types: default_guardian_visible(),
            default_outcomes: HashMap::new(),
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            backend: default_memory_backend(),
        }
    }
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            retention_hours: default_message_retention(),
        }
    }
}

impl MessagingConfig {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours.max(1))
    }
}

impl Default for IndependenceConfig {
    fn default() -> Self {
        Self {
            backend: default_memory_backend(),
            evaluation_interval_secs: default_evaluation_interval(),
            warning_days: default_warning_days(),
            preparation_days: default_preparation_days(),
            grace_hours: default_grace_hours(),
            maturity_threshold: default_maturity_threshold(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: default_dispatch_timeout(),
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otel_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let server = ServerConfig::default();
        assert_eq!(server.host, "0.0.0.0");
        assert_eq!(server.port, 8081);

        let presence = PresenceConfig::default();
        assert_eq!(presence.idle_timeout(), Duration::from_secs(300));
        assert_eq!(presence.sweep_interval_secs, 60);

        let retry = RetryConfig::default();
        assert_eq!(retry.base_delay_ms, 100);
        assert_eq!(retry.max_attempts, 3);

        assert_eq!(DirectoryConfig::default().backend, "memory");
        assert_eq!(IndependenceConfig::default().backend, "memory");
        assert_eq!(MessagingConfig::default().retention(), chrono::Duration::days(7));
    }

    #[test]
    fn test_retention_defaults() {
        let retention = RetentionConfig::default();
        assert_eq!(retention.in_app_days, 30);
        assert_eq!(retention.push_days, 7);
        assert_eq!(retention.email_days, 90);
    }

    #[test]
    fn test_failure_policy_is_required() {
        let raw = r#"{ "group": "g" }"#;
        let parsed: Result<ConsumerSettings, _> = serde_json::from_str(raw);
        assert!(parsed.is_err());

        let raw = r#"{ "group": "g", "failure_policy": "skip_and_continue" }"#;
        let parsed: ConsumerSettings = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.failure_policy, FailurePolicy::SkipAndContinue);
        assert_eq!(parsed.topics.len(), Topic::ALL.len());
    }
}

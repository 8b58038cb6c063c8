mod settings;

pub use settings::{
    ApiConfig, BrokerConfig, ConsumerSettings, DatabaseConfig, DirectoryConfig, DispatchConfig,
    GuardianConfig, InboxConfig, IndependenceConfig, JwtConfig, MessagingConfig, OtelConfig,
    PresenceConfig, RedisConfig, RetentionConfig, RetryConfig, ServerConfig, Settings,
};

// Infrastructure layer (shared components)
pub mod infrastructure;

pub use infrastructure::auth;
pub use infrastructure::config;
pub use infrastructure::error;
pub use infrastructure::metrics;
pub use infrastructure::postgres;
pub use infrastructure::redis;
pub use infrastructure::resilience;

// Domain layer
pub mod broker;
pub mod delivery;
pub mod guardian;
pub mod inbox;
pub mod messaging;
pub mod notification;
pub mod pipeline;
pub mod presence;

// Application layer
pub mod api;
pub mod server;
pub mod websocket;

// Supporting modules
pub mod shutdown;
pub mod tasks;
pub mod telemetry;

//! API layer - HTTP endpoint handlers organized by domain.

mod directory;
mod events;
mod guardian;
mod health;
mod inbox;
mod metrics;
mod routes;

pub use directory::{
    override_independence, set_participants, upsert_account, upsert_independence, AccountUpdate,
    Participant, ParticipantsUpdate, PhaseOverride,
};
pub use events::{publish_event, PublishRequest, PublishResponse};
pub use guardian::{approve, deny, get_approval, list_pending};
pub use health::{health, stats, HealthResponse, StatsResponse};
pub use inbox::{cleanup, mark_all_read, mark_delivered, mark_read, undelivered, unread_count};
pub use metrics::prometheus_metrics;
pub use routes::api_routes;

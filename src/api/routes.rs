use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};

use crate::server::{api_key_auth, AppState};

use super::directory::{override_independence, set_participants, upsert_account, upsert_independence};
use super::events::publish_event;
use super::guardian::{approve, deny, get_approval, list_pending};
use super::health::{health, stats};
use super::inbox::{cleanup, mark_all_read, mark_delivered, mark_read, undelivered, unread_count};
use super::metrics::prometheus_metrics;

pub fn api_routes(state: AppState) -> Router<AppState> {
    // User-facing routes authenticate through the `AuthUser` extractor
    let user_routes = Router::new()
        .route("/inbox/undelivered", get(undelivered))
        .route("/inbox/unread-count", get(unread_count))
        .route("/inbox/{id}/delivered", post(mark_delivered))
        .route("/inbox/{id}/read", post(mark_read))
        .route("/inbox/read-all", post(mark_all_read))
        .route("/guardian/approvals", get(list_pending))
        .route("/guardian/approvals/{id}", get(get_approval))
        .route("/guardian/approvals/{id}/approve", post(approve))
        .route("/guardian/approvals/{id}/deny", post(deny));

    let service_routes = Router::new()
        .route("/events/{topic}", post(publish_event))
        .route("/accounts/{user_id}", put(upsert_account))
        .route("/conversations/{id}", put(set_participants))
        .route("/independence/{kid_id}", put(upsert_independence))
        .route("/independence/{kid_id}/override", post(override_independence))
        .route("/admin/inbox/cleanup", post(cleanup))
        .route_layer(middleware::from_fn_with_state(state, api_key_auth));

    Router::new()
        // Health, stats & metrics
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(prometheus_metrics))
        .nest("/api/v1", user_routes.merge(service_routes))
}

//! Inbox and sync endpoints for the authenticated user.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::inbox::{pull_undelivered, SyncBatch};
use crate::metrics::InboxMetrics;
use crate::server::{AppState, AuthUser};

#[derive(Debug, Deserialize)]
pub struct SyncQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct UnreadCountResponse {
    pub unread_count: u64,
}

#[derive(Debug, Serialize)]
pub struct DeliveredResponse {
    pub id: Uuid,
    pub delivered: bool,
}

#[derive(Debug, Serialize)]
pub struct ReadResponse {
    pub id: Uuid,
    pub changed: bool,
    pub unread_count: u64,
}

#[derive(Debug, Serialize)]
pub struct ReadAllResponse {
    pub marked: usize,
    pub unread_count: u64,
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub deleted: usize,
}

/// GET /api/v1/inbox/undelivered?limit=N
pub async fn undelivered(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<SyncQuery>,
) -> Result<Json<SyncBatch>> {
    let batch = pull_undelivered(
        state.inbox.as_ref(),
        user.user_id(),
        query.limit,
        state.settings.inbox.sync_batch_limit,
    )
    .await?;
    Ok(Json(batch))
}

/// GET /api/v1/inbox/unread-count
pub async fn unread_count(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<UnreadCountResponse>> {
    let unread_count = state.inbox.unread_count(user.user_id()).await?;
    Ok(Json(UnreadCountResponse { unread_count }))
}

/// POST /api/v1/inbox/{id}/delivered
pub async fn mark_delivered(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<DeliveredResponse>> {
    let changed = state.inbox.mark_delivered(user.user_id(), &[id]).await?;
    Ok(Json(DeliveredResponse {
        id,
        delivered: changed > 0,
    }))
}

/// POST /api/v1/inbox/{id}/read
pub async fn mark_read(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ReadResponse>> {
    let changed = state.inbox.mark_read(user.user_id(), id).await?;
    let unread_count = state.inbox.unread_count(user.user_id()).await?;
    Ok(Json(ReadResponse {
        id,
        changed,
        unread_count,
    }))
}

/// POST /api/v1/inbox/read-all
pub async fn mark_all_read(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<ReadAllResponse>> {
    let marked = state.inbox.mark_all_read(user.user_id()).await?;
    Ok(Json(ReadAllResponse {
        marked,
        unread_count: 0,
    }))
}

/// POST /api/v1/admin/inbox/cleanup
pub async fn cleanup(State(state): State<AppState>) -> Result<Json<CleanupResponse>> {
    let deleted = state
        .inbox
        .cleanup_expired(&state.retention, Utc::now())
        .await?;
    InboxMetrics::record_expired(deleted);
    tracing::info!(deleted, "Manual inbox cleanup completed");
    Ok(Json(CleanupResponse { deleted }))
}

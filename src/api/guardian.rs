//! Guardian approval endpoints.

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::guardian::ApprovalRecord;
use crate::server::{AppState, AuthUser};

/// GET /api/v1/guardian/approvals
///
/// Pending requests addressed to the caller.
pub async fn list_pending(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<ApprovalRecord>>> {
    let pending = state.approvals.pending_for_guardian(user.user_id()).await?;
    Ok(Json(pending))
}

/// GET /api/v1/guardian/approvals/{id}
///
/// Visible to the guardian, the kid and the requester.
pub async fn get_approval(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApprovalRecord>> {
    let record = state
        .approvals
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Approval {} not found", id)))?;

    let caller = user.user_id();
    let request = &record.request;
    let involved = request.guardian_id == caller
        || request.kid_account_id == caller
        || request.requester_id.as_deref() == Some(caller);
    if !involved {
        return Err(AppError::Forbidden(format!(
            "Approval {} is not visible to {}",
            id, caller
        )));
    }

    Ok(Json(record))
}

/// POST /api/v1/guardian/approvals/{id}/approve
pub async fn approve(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApprovalRecord>> {
    let record = state.approvals.approve(id, user.user_id(), Utc::now()).await?;
    Ok(Json(record))
}

/// POST /api/v1/guardian/approvals/{id}/deny
pub async fn deny(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApprovalRecord>> {
    let record = state.approvals.deny(id, user.user_id(), Utc::now()).await?;
    Ok(Json(record))
}

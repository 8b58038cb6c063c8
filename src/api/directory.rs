//! Service endpoints that feed the account and room directories and the
//! independence evaluator.

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::guardian::{IndependenceProfile, IndependenceUpdate};
use crate::notification::{AccountProfile, IndependencePhase};
use crate::presence::{is_valid_id, MemberRole, RoomMember};
use crate::server::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountUpdate {
    #[serde(default)]
    pub is_minor: bool,
    #[serde(default)]
    pub guardian_id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ParticipantsUpdate {
    pub participants: Vec<Participant>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: String,
    #[serde(default)]
    pub role: MemberRole,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantsResponse {
    pub conversation_id: String,
    pub participants: usize,
}

#[derive(Debug, Deserialize)]
pub struct PhaseOverride {
    pub phase: IndependencePhase,
}

/// PUT /api/v1/accounts/{user_id}
///
/// The independence flag is owned by the evaluator and kept as is.
pub async fn upsert_account(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(update): Json<AccountUpdate>,
) -> Result<Json<AccountProfile>> {
    if !is_valid_id(&user_id) {
        return Err(AppError::Validation(format!("Invalid user id: {}", user_id)));
    }
    if update.is_minor && update.guardian_id.is_none() {
        return Err(AppError::Validation(
            "A minor account needs a guardianId".to_string(),
        ));
    }

    let current = state.directory.profile(&user_id).await?;
    let profile = AccountProfile {
        user_id: user_id.clone(),
        is_minor: update.is_minor,
        guardian_id: update.guardian_id,
        independent: current.independent,
        display_name: update.display_name,
    };
    state.directory.upsert(profile.clone()).await?;

    tracing::info!(user_id = %user_id, is_minor = profile.is_minor, "Account profile updated");
    Ok(Json(profile))
}

/// PUT /api/v1/conversations/{id}
pub async fn set_participants(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Json(update): Json<ParticipantsUpdate>,
) -> Result<Json<ParticipantsResponse>> {
    if !is_valid_id(&conversation_id) {
        return Err(AppError::Validation(format!(
            "Invalid conversation id: {}",
            conversation_id
        )));
    }
    if let Some(bad) = update.participants.iter().find(|p| !is_valid_id(&p.user_id)) {
        return Err(AppError::Validation(format!("Invalid user id: {}", bad.user_id)));
    }

    let members: Vec<RoomMember> = update
        .participants
        .into_iter()
        .map(|p| RoomMember::new(p.user_id, p.role))
        .collect();

    state
        .presence
        .rooms()
        .set_members(&conversation_id, members)
        .await?;
    let participants = state.presence.rooms().members(&conversation_id).await?.len();

    tracing::info!(conversation_id = %conversation_id, participants, "Conversation participants set");
    Ok(Json(ParticipantsResponse {
        conversation_id,
        participants,
    }))
}

/// PUT /api/v1/independence/{kid_id}
pub async fn upsert_independence(
    State(state): State<AppState>,
    Path(kid_id): Path<String>,
    Json(update): Json<IndependenceUpdate>,
) -> Result<Json<IndependenceProfile>> {
    if !(0.0..=1.0).contains(&update.maturity_score) {
        return Err(AppError::Validation(
            "maturityScore must be between 0 and 1".to_string(),
        ));
    }
    let profile = state
        .independence
        .upsert(&kid_id, update, Utc::now())
        .await?;
    Ok(Json(profile))
}

/// POST /api/v1/independence/{kid_id}/override
pub async fn override_independence(
    State(state): State<AppState>,
    Path(kid_id): Path<String>,
    Json(body): Json<PhaseOverride>,
) -> Result<Json<IndependenceProfile>> {
    let profile = state
        .independence
        .override_phase(&kid_id, body.phase, Utc::now())
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No independence profile for {}", kid_id)))?;
    Ok(Json(profile))
}

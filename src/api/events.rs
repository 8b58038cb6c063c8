//! Event publish endpoint for producer services.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broker::{AppendOutcome, EnvelopeHeaders, EventEnvelope, Topic, SCHEMA_VERSION};
use crate::error::{AppError, Result};
use crate::server::AppState;

/// Envelope as posted by a producer. Omitted ids and timestamps are filled
/// in here; producers that retry should send their own `id`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub schema_version: Option<u16>,
    pub event_type: String,
    pub producer_id: String,
    pub subject_user_id: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub headers: EnvelopeHeaders,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl PublishRequest {
    fn into_envelope(self) -> EventEnvelope {
        EventEnvelope {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            schema_version: self.schema_version.unwrap_or(SCHEMA_VERSION),
            event_type: self.event_type,
            producer_id: self.producer_id,
            subject_user_id: self.subject_user_id,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            headers: self.headers,
            payload: self.payload,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishResponse {
    pub event_id: Uuid,
    pub topic: String,
    pub partition: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    pub duplicate: bool,
}

/// POST /api/v1/events/{topic}
///
/// 202 once the broker holds the envelope, 400 for an unknown topic or a
/// malformed envelope, 503 when the broker stays unavailable after retries.
pub async fn publish_event(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    Json(request): Json<PublishRequest>,
) -> Result<(StatusCode, Json<PublishResponse>)> {
    let topic = Topic::parse(&topic)
        .ok_or_else(|| AppError::Validation(format!("Unknown topic: {}", topic)))?;
    let envelope = request.into_envelope();

    let receipt = state.producer.publish(topic, &envelope).await?;

    let record_id = match &receipt.outcome {
        AppendOutcome::Appended { record_id } => Some(record_id.clone()),
        AppendOutcome::Duplicate => None,
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(PublishResponse {
            event_id: envelope.id,
            topic: topic.stream_name().to_string(),
            partition: receipt.partition,
            record_id,
            duplicate: receipt.is_duplicate(),
        }),
    ))
}

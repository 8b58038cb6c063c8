//! Versioned event envelope exchanged between producers and the pipeline.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::notification::{ChannelSet, Priority};

pub const SCHEMA_VERSION: u16 = 1;

/// Namespace for ids of envelopes re-emitted after guardian approval.
const REEMIT_NAMESPACE: Uuid = Uuid::from_u128(0x2b8e_51d0_7c4a_4f6e_a3d9_18c7_e05f_6a21);

/// Stream field carrying the serialized envelope.
pub const FIELD_ENVELOPE: &str = "envelope";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("unsupported schema version {0}")]
    UnsupportedSchema(u16),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("malformed envelope: {0}")]
    Malformed(String),
}

/// Optional routing hints set by the producer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeHeaders {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<ChannelSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<Uuid>,
    /// Approved guardian request that authorizes this event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<Uuid>,
}

/// Immutable once published. `subject_user_id` is the partition key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub id: Uuid,
    pub schema_version: u16,
    pub event_type: String,
    pub producer_id: String,
    pub subject_user_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub headers: EnvelopeHeaders,
    #[serde(default)]
    pub payload: Value,
}

impl EventEnvelope {
    pub fn new(
        event_type: impl Into<String>,
        producer_id: impl Into<String>,
        subject_user_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            schema_version: SCHEMA_VERSION,
            event_type: event_type.into(),
            producer_id: producer_id.into(),
            subject_user_id: subject_user_id.into(),
            timestamp: Utc::now(),
            headers: EnvelopeHeaders::default(),
            payload,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.headers.priority = Some(priority);
        self
    }

    pub fn with_channels(mut self, channels: ChannelSet) -> Self {
        self.headers.channels = Some(channels);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.headers.correlation_id = Some(correlation_id.into());
        self
    }

    /// Boundary check applied by producers and consumers alike.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(EnvelopeError::UnsupportedSchema(self.schema_version));
        }
        if self.id.is_nil() {
            return Err(EnvelopeError::MissingField("id"));
        }
        if self.event_type.trim().is_empty() {
            return Err(EnvelopeError::MissingField("eventType"));
        }
        if self.producer_id.trim().is_empty() {
            return Err(EnvelopeError::MissingField("producerId"));
        }
        if self.subject_user_id.trim().is_empty() {
            return Err(EnvelopeError::MissingField("subjectUserId"));
        }
        if !(self.payload.is_object() || self.payload.is_null()) {
            return Err(EnvelopeError::Malformed("payload must be an object".into()));
        }
        Ok(())
    }

    /// Copy carrying an approval. The new id is derived from the original and
    /// the approval, so re-emitting twice lands on the same dedup key.
    pub fn reemit_with_approval(&self, approval_id: Uuid) -> Self {
        let name = format!("{}:{}", self.id, approval_id);
        let mut next = self.clone();
        next.id = Uuid::new_v5(&REEMIT_NAMESPACE, name.as_bytes());
        next.timestamp = Utc::now();
        next.headers.parent_event_id = Some(self.id);
        next.headers.approval_id = Some(approval_id);
        next
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    pub fn payload_f64(&self, key: &str) -> Option<f64> {
        self.payload.get(key).and_then(Value::as_f64)
    }

    pub fn payload_bool(&self, key: &str) -> Option<bool> {
        self.payload.get(key).and_then(Value::as_bool)
    }

    /// Stream record fields: the envelope plus flat routing headers.
    pub fn to_record_fields(&self) -> Result<Vec<(String, String)>, EnvelopeError> {
        let body = serde_json::to_string(self).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        let priority = self
            .headers
            .priority
            .map(|p| p.as_str())
            .unwrap_or_default();

        Ok(vec![
            (FIELD_ENVELOPE.to_string(), body),
            ("eventType".to_string(), self.event_type.clone()),
            ("userId".to_string(), self.subject_user_id.clone()),
            ("source".to_string(), self.producer_id.clone()),
            ("priority".to_string(), priority.to_string()),
        ])
    }

    /// Decode and validate a stream record.
    pub fn from_record_fields(fields: &HashMap<String, String>) -> Result<Self, EnvelopeError> {
        let body = fields
            .get(FIELD_ENVELOPE)
            .ok_or(EnvelopeError::MissingField(FIELD_ENVELOPE))?;
        Self::decode(body)
    }

    pub fn decode(body: &str) -> Result<Self, EnvelopeError> {
        let envelope: EventEnvelope =
            serde_json::from_str(body).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }
}

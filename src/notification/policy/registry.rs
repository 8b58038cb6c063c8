use std::collections::HashMap;

use smallvec::SmallVec;

use crate::broker::{EnvelopeError, EventEnvelope};
use crate::notification::{
    AccountProfile, ChannelSet, NotificationKind, NotificationType, Priority,
};

/// What a builder wants delivered, before defaults and gating.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationDraft {
    pub recipient_id: String,
    pub notification_type: NotificationType,
    pub sender_id: Option<String>,
    pub title: String,
    pub message: String,
    pub priority: Option<Priority>,
    pub channels: Option<ChannelSet>,
    pub kind: NotificationKind,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl NotificationDraft {
    pub fn new(
        recipient_id: impl Into<String>,
        notification_type: NotificationType,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            notification_type,
            sender_id: None,
            title: title.into(),
            message: message.into(),
            priority: None,
            channels: None,
            kind: NotificationKind::Social,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn from_sender(mut self, sender_id: Option<String>) -> Self {
        self.sender_id = sender_id;
        self
    }

    pub fn with_kind(mut self, kind: NotificationKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_channels(mut self, channels: ChannelSet) -> Self {
        self.channels = Some(channels);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Copy a payload string into metadata when present.
    pub fn with_payload_ref(self, envelope: &EventEnvelope, key: &str) -> Self {
        match envelope.payload_str(key) {
            Some(value) => self.with_metadata(key, value),
            None => self,
        }
    }
}

pub type Drafts = SmallVec<[NotificationDraft; 2]>;

/// Context handed to builders.
pub struct BuildContext<'a> {
    pub subject: &'a AccountProfile,
}

pub type BuilderFn = fn(&EventEnvelope, &BuildContext<'_>) -> Result<Drafts, EnvelopeError>;

/// Maps event types to builders. Event types without an entry are rejected.
#[derive(Default)]
pub struct BuilderRegistry {
    builders: HashMap<&'static str, BuilderFn>,
}

impl BuilderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry populated with every built-in event type.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        super::builders::register_defaults(&mut registry);
        registry
    }

    pub fn register(&mut self, event_type: &'static str, builder: BuilderFn) -> &mut Self {
        if self.builders.insert(event_type, builder).is_some() {
            tracing::warn!(event_type, "Builder replaced");
        }
        self
    }

    pub fn get(&self, event_type: &str) -> Option<BuilderFn> {
        self.builders.get(event_type).copied()
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.builders.contains_key(event_type)
    }

    pub fn event_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.builders.keys().copied().collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.builders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }
}

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::notification::DirectoryError;
use crate::presence::PresenceError;

/// Longest message body accepted, in characters.
pub const MAX_MESSAGE_CHARS: usize = 4000;

const MAX_EMOJI_CHARS: usize = 32;

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("user {user_id} is not a participant of conversation {conversation_id}")]
    NotMember {
        user_id: String,
        conversation_id: String,
    },

    #[error("message content is empty")]
    EmptyMessage,

    #[error("message is {len} characters, limit is {max}")]
    MessageTooLong { len: usize, max: usize },

    #[error("message {0} not found")]
    UnknownMessage(Uuid),

    #[error("invalid reaction")]
    InvalidReaction,

    #[error(transparent)]
    Presence(#[from] PresenceError),

    #[error("room directory error: {0}")]
    Directory(#[from] DirectoryError),
}

impl MessagingError {
    pub fn code(&self) -> &'static str {
        match self {
            MessagingError::NotMember { .. } => "NOT_MEMBER",
            MessagingError::EmptyMessage => "EMPTY_MESSAGE",
            MessagingError::MessageTooLong { .. } => "MESSAGE_TOO_LONG",
            MessagingError::UnknownMessage(_) => "UNKNOWN_MESSAGE",
            MessagingError::InvalidReaction => "INVALID_REACTION",
            MessagingError::Presence(e) => e.code(),
            MessagingError::Directory(_) => "DIRECTORY_UNAVAILABLE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    File,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    /// emoji -> users who reacted with it
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reactions: BTreeMap<String, Vec<String>>,
}

impl ChatMessage {
    pub fn new(
        conversation_id: impl Into<String>,
        sender_id: impl Into<String>,
        content: impl Into<String>,
        message_type: MessageType,
        reply_to: Option<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            content: content.into(),
            message_type,
            reply_to,
            created_at: Utc::now(),
            reactions: BTreeMap::new(),
        }
    }

    /// Add a reaction. `false` if the user already reacted with that emoji.
    pub fn react(&mut self, user_id: &str, emoji: &str) -> bool {
        let users = self.reactions.entry(emoji.to_string()).or_default();
        if users.iter().any(|u| u == user_id) {
            return false;
        }
        users.push(user_id.to_string());
        true
    }
}

pub fn validate_content(content: &str) -> Result<(), MessagingError> {
    if content.trim().is_empty() {
        return Err(MessagingError::EmptyMessage);
    }
    let len = content.chars().count();
    if len > MAX_MESSAGE_CHARS {
        return Err(MessagingError::MessageTooLong {
            len,
            max: MAX_MESSAGE_CHARS,
        });
    }
    Ok(())
}

pub fn validate_emoji(emoji: &str) -> Result<(), MessagingError> {
    let len = emoji.chars().count();
    if emoji.trim().is_empty() || len > MAX_EMOJI_CHARS {
        return Err(MessagingError::InvalidReaction);
    }
    Ok(())
}

//! Conversations: messages, typing, reactions and unread counts.

mod service;
mod types;

pub use service::{ConversationService, PruneSummary};
pub use types::{
    validate_content, ChatMessage, MessageType, MessagingError, MAX_MESSAGE_CHARS,
};

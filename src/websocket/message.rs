use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::messaging::{ChatMessage, MessageType};
use crate::notification::Notification;

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    JoinConversation {
        conversation_id: String,
    },
    LeaveConversation {
        conversation_id: String,
    },
    SendMessage {
        conversation_id: String,
        content: String,
        #[serde(default)]
        message_type: MessageType,
        #[serde(default)]
        reply_to: Option<Uuid>,
    },
    TypingStart {
        conversation_id: String,
    },
    TypingStop {
        conversation_id: String,
    },
    AddReaction {
        message_id: Uuid,
        emoji: String,
    },
    Sync {
        #[serde(default)]
        limit: Option<usize>,
    },
    Ack {
        notification_ids: Vec<Uuid>,
    },
    Ping,
}

impl ClientMessage {
    /// Label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::JoinConversation { .. } => "join_conversation",
            ClientMessage::LeaveConversation { .. } => "leave_conversation",
            ClientMessage::SendMessage { .. } => "send_message",
            ClientMessage::TypingStart { .. } => "typing_start",
            ClientMessage::TypingStop { .. } => "typing_stop",
            ClientMessage::AddReaction { .. } => "add_reaction",
            ClientMessage::Sync { .. } => "sync",
            ClientMessage::Ack { .. } => "ack",
            ClientMessage::Ping => "ping",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Online,
    Offline,
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Notification {
        notification: Box<Notification>,
    },
    NewMessage {
        message: ChatMessage,
    },
    ConversationUpdated {
        conversation_id: String,
        unread_count: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_message_id: Option<Uuid>,
    },
    ReactionAdded {
        conversation_id: String,
        message_id: Uuid,
        user_id: String,
        emoji: String,
    },
    UserStatusChanged {
        user_id: String,
        status: UserStatus,
    },
    UserTyping {
        conversation_id: String,
        user_id: String,
        is_typing: bool,
    },
    JoinedConversation {
        conversation_id: String,
    },
    LeftConversation {
        conversation_id: String,
    },
    MessageSent {
        conversation_id: String,
        message_id: Uuid,
    },
    SyncBatch {
        notifications: Vec<Notification>,
        unread_count: u64,
        has_more: bool,
    },
    Acked {
        notification_ids: Vec<Uuid>,
        acknowledged: usize,
    },
    Pong,
    Heartbeat,
    Error {
        code: String,
        message: String,
    },
    /// Server is going away; reconnect after the given delay
    Shutdown {
        reconnect_after_secs: u64,
    },
}

impl ServerMessage {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn notification(notification: Notification) -> Self {
        Self::Notification {
            notification: Box::new(notification),
        }
    }

    /// Ephemeral messages are dropped rather than queued for offline users.
    pub fn is_ephemeral(&self) -> bool {
        matches!(
            self,
            ServerMessage::UserTyping { .. }
                | ServerMessage::ReactionAdded { .. }
                | ServerMessage::UserStatusChanged { .. }
                | ServerMessage::Heartbeat
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_wire_format() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"send_message","payload":{"conversation_id":"c1","content":"hi"}}"#,
        )
        .unwrap();
        let ClientMessage::SendMessage {
            conversation_id,
            message_type,
            reply_to,
            ..
        } = msg
        else {
            panic!("expected send_message");
        };
        assert_eq!(conversation_id, "c1");
        assert_eq!(message_type, MessageType::Text);
        assert!(reply_to.is_none());

        let ping: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(ping.kind(), "ping");

        let sync: ClientMessage = serde_json::from_str(r#"{"type":"sync","payload":{}}"#).unwrap();
        assert!(matches!(sync, ClientMessage::Sync { limit: None }));
    }

    #[test]
    fn test_server_message_tags() {
        let json = serde_json::to_value(ServerMessage::UserStatusChanged {
            user_id: "u1".into(),
            status: UserStatus::Online,
        })
        .unwrap();
        assert_eq!(json["type"], "user_status_changed");
        assert_eq!(json["status"], "online");

        let json = serde_json::to_value(ServerMessage::Shutdown {
            reconnect_after_secs: 5,
        })
        .unwrap();
        assert_eq!(json["type"], "shutdown");
        assert_eq!(json["reconnect_after_secs"], 5);

        let json = serde_json::to_value(ServerMessage::Pong).unwrap();
        assert_eq!(json["type"], "pong");
    }

    #[test]
    fn test_ephemeral_classification() {
        assert!(ServerMessage::Heartbeat.is_ephemeral());
        assert!(!ServerMessage::Pong.is_ephemeral());
        assert!(!ServerMessage::error("X", "y").is_ephemeral());
    }
}

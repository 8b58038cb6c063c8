use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use tracing::instrument;
use uuid::Uuid;

use crate::broker::EventEnvelope;
use crate::pipeline::NotificationPipeline;
use crate::presence::{PresenceGateway, Room, RoomDirectory};
use crate::websocket::{ServerMessage, UserStatus};

use super::types::{validate_content, validate_emoji, ChatMessage, MessageType, MessagingError};

const MESSAGE_NAMESPACE: Uuid = Uuid::from_u128(0x41c7_9be2_5a03_4f18_9d6e_0b72_f3a8_15c4);
const PRODUCER_ID: &str = "messaging";

/// Unread messages for one participant in one conversation.
#[derive(Debug, Clone, Copy)]
struct UnreadCounter {
    count: u64,
    last_message_at: DateTime<Utc>,
}

/// What one prune pass dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneSummary {
    pub messages: usize,
    pub unread_counters: usize,
}

/// Conversations over the presence gateway. Participants in the room get
/// the message live; everyone else gets an unread bump, and offline
/// participants a `direct_message` notification through the policy gate.
pub struct ConversationService {
    presence: Arc<PresenceGateway>,
    pipeline: Arc<NotificationPipeline>,
    messages: DashMap<Uuid, ChatMessage>,
    /// (conversation_id, user_id) -> unread messages
    unread: DashMap<(String, String), UnreadCounter>,
}

impl ConversationService {
    pub fn new(presence: Arc<PresenceGateway>, pipeline: Arc<NotificationPipeline>) -> Self {
        Self {
            presence,
            pipeline,
            messages: DashMap::new(),
            unread: DashMap::new(),
        }
    }

    fn rooms(&self) -> &Arc<dyn RoomDirectory> {
        self.presence.rooms()
    }

    async fn ensure_member(&self, conversation_id: &str, user_id: &str) -> Result<(), MessagingError> {
        if self.rooms().is_member(conversation_id, user_id).await? {
            Ok(())
        } else {
            Err(MessagingError::NotMember {
                user_id: user_id.to_string(),
                conversation_id: conversation_id.to_string(),
            })
        }
    }

    /// Join the conversation room and clear its unread count.
    pub async fn join(
        &self,
        connection_id: Uuid,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<(), MessagingError> {
        self.presence
            .join_room(connection_id, &Room::conversation(conversation_id))
            .await?;
        self.unread
            .remove(&(conversation_id.to_string(), user_id.to_string()));
        Ok(())
    }

    pub fn leave(&self, connection_id: Uuid, conversation_id: &str) -> bool {
        self.presence
            .leave_room(connection_id, &Room::conversation(conversation_id))
    }

    #[instrument(
        name = "messaging.send",
        skip(self, content),
        fields(conversation_id = %conversation_id, sender_id = %sender_id)
    )]
    pub async fn send_message(
        &self,
        sender_id: &str,
        conversation_id: &str,
        content: &str,
        message_type: MessageType,
        reply_to: Option<Uuid>,
    ) -> Result<ChatMessage, MessagingError> {
        validate_content(content)?;

        let members = self.rooms().members(conversation_id).await?;
        if !members.iter().any(|m| m.user_id == sender_id) {
            return Err(MessagingError::NotMember {
                user_id: sender_id.to_string(),
                conversation_id: conversation_id.to_string(),
            });
        }

        let message = ChatMessage::new(conversation_id, sender_id, content, message_type, reply_to);
        self.messages.insert(message.id, message.clone());

        let room = Room::conversation(conversation_id);
        self.presence.broadcast(
            &room,
            &ServerMessage::NewMessage {
                message: message.clone(),
            },
            None,
        );

        for member in members.iter().filter(|m| m.user_id != sender_id) {
            let unread_count = self.bump_unread(conversation_id, &member.user_id, message.created_at);

            if self.presence.is_online(&member.user_id) {
                self.presence.send_to_user(
                    &member.user_id,
                    &ServerMessage::ConversationUpdated {
                        conversation_id: conversation_id.to_string(),
                        unread_count,
                        last_message_id: Some(message.id),
                    },
                );
            } else if let Err(e) = self.notify_offline(&message, &member.user_id).await {
                tracing::warn!(
                    recipient_id = %member.user_id,
                    message_id = %message.id,
                    error = %e,
                    "Failed to notify offline participant"
                );
            }
        }

        Ok(message)
    }

    async fn notify_offline(&self, message: &ChatMessage, recipient_id: &str) -> Result<(), crate::error::NotifyError> {
        let actor_name = self
            .pipeline
            .engine()
            .directory()
            .profile(&message.sender_id)
            .await
            .ok()
            .and_then(|p| p.display_name);

        let mut payload = json!({
            "conversationId": message.conversation_id,
            "messageId": message.id,
            "actorId": message.sender_id,
            "content": message.content,
        });
        if let Some(name) = actor_name {
            payload["actorName"] = name.into();
        }

        let mut envelope = EventEnvelope::new("message.sent", PRODUCER_ID, recipient_id, payload);
        let name = format!("{}:{}", message.id, recipient_id);
        envelope.id = Uuid::new_v5(&MESSAGE_NAMESPACE, name.as_bytes());

        self.pipeline.process(&envelope).await?;
        Ok(())
    }

    fn bump_unread(&self, conversation_id: &str, user_id: &str, at: DateTime<Utc>) -> u64 {
        let mut counter = self
            .unread
            .entry((conversation_id.to_string(), user_id.to_string()))
            .or_insert(UnreadCounter {
                count: 0,
                last_message_at: at,
            });
        counter.count += 1;
        counter.last_message_at = counter.last_message_at.max(at);
        counter.count
    }

    pub fn unread_count(&self, conversation_id: &str, user_id: &str) -> u64 {
        self.unread
            .get(&(conversation_id.to_string(), user_id.to_string()))
            .map(|c| c.count)
            .unwrap_or(0)
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Drop messages created before `cutoff` and unread counters with no
    /// message since. Offline participants keep their inbox entries.
    pub fn prune(&self, cutoff: DateTime<Utc>) -> PruneSummary {
        let messages_before = self.messages.len();
        self.messages.retain(|_, message| message.created_at >= cutoff);
        let unread_before = self.unread.len();
        self.unread.retain(|_, counter| counter.last_message_at >= cutoff);

        PruneSummary {
            messages: messages_before.saturating_sub(self.messages.len()),
            unread_counters: unread_before.saturating_sub(self.unread.len()),
        }
    }

    pub fn get_message(&self, message_id: Uuid) -> Option<ChatMessage> {
        self.messages.get(&message_id).map(|m| m.clone())
    }

    /// Typing signals are ephemeral: broadcast to the room, never stored.
    pub async fn typing(
        &self,
        user_id: &str,
        conversation_id: &str,
        is_typing: bool,
        exclude: Option<Uuid>,
    ) -> Result<(), MessagingError> {
        self.ensure_member(conversation_id, user_id).await?;
        self.presence.broadcast(
            &Room::conversation(conversation_id),
            &ServerMessage::UserTyping {
                conversation_id: conversation_id.to_string(),
                user_id: user_id.to_string(),
                is_typing,
            },
            exclude,
        );
        Ok(())
    }

    pub async fn add_reaction(
        &self,
        user_id: &str,
        message_id: Uuid,
        emoji: &str,
    ) -> Result<ChatMessage, MessagingError> {
        validate_emoji(emoji)?;
        let conversation_id = self
            .messages
            .get(&message_id)
            .map(|m| m.conversation_id.clone())
            .ok_or(MessagingError::UnknownMessage(message_id))?;
        self.ensure_member(&conversation_id, user_id).await?;

        let (message, added) = {
            let mut entry = self
                .messages
                .get_mut(&message_id)
                .ok_or(MessagingError::UnknownMessage(message_id))?;
            let added = entry.react(user_id, emoji);
            (entry.clone(), added)
        };

        if added {
            self.presence.broadcast(
                &Room::conversation(conversation_id.as_str()),
                &ServerMessage::ReactionAdded {
                    conversation_id: conversation_id.clone(),
                    message_id,
                    user_id: user_id.to_string(),
                    emoji: emoji.to_string(),
                },
                None,
            );
        }
        Ok(message)
    }

    /// Tell every conversation the user is in that they came or went.
    pub async fn broadcast_status(&self, user_id: &str, status: UserStatus) -> Result<usize, MessagingError> {
        let conversations = self.rooms().conversations_for(user_id).await?;
        let message = ServerMessage::UserStatusChanged {
            user_id: user_id.to_string(),
            status,
        };
        for conversation_id in &conversations {
            self.presence
                .broadcast(&Room::conversation(conversation_id.as_str()), &message, None);
        }
        Ok(conversations.len())
    }
}

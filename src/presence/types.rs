//! Session handle, room naming and errors

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::notification::DirectoryError;
use crate::websocket::ServerMessage;

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("user {user_id} already has {max} sessions")]
    SessionLimit { user_id: String, max: usize },

    #[error("session already joined {max} rooms")]
    RoomLimit { max: usize },

    #[error("user {user_id} is not a member of {room}")]
    NotMember { user_id: String, room: String },

    #[error("session {0} not found")]
    UnknownSession(Uuid),

    #[error("invalid room name: {0}")]
    InvalidRoom(String),

    #[error("room directory error: {0}")]
    Directory(#[from] DirectoryError),
}

impl PresenceError {
    pub fn code(&self) -> &'static str {
        match self {
            PresenceError::SessionLimit { .. } => "SESSION_LIMIT",
            PresenceError::RoomLimit { .. } => "ROOM_LIMIT",
            PresenceError::NotMember { .. } => "NOT_MEMBER",
            PresenceError::UnknownSession(_) => "UNKNOWN_SESSION",
            PresenceError::InvalidRoom(_) => "INVALID_ROOM",
            PresenceError::Directory(_) => "DIRECTORY_UNAVAILABLE",
        }
    }
}

/// A push target. Personal rooms are `user:{id}`, conversations are
/// `conversation:{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Room {
    Personal(String),
    Conversation(String),
}

impl Room {
    pub fn personal(user_id: impl Into<String>) -> Self {
        Room::Personal(user_id.into())
    }

    pub fn conversation(conversation_id: impl Into<String>) -> Self {
        Room::Conversation(conversation_id.into())
    }

    pub fn key(&self) -> String {
        self.to_string()
    }

    pub fn parse(name: &str) -> Result<Self, PresenceError> {
        let (kind, id) = name
            .split_once(':')
            .filter(|(_, id)| is_valid_id(id))
            .ok_or_else(|| PresenceError::InvalidRoom(name.to_string()))?;
        match kind {
            "user" => Ok(Room::Personal(id.to_string())),
            "conversation" => Ok(Room::Conversation(id.to_string())),
            _ => Err(PresenceError::InvalidRoom(name.to_string())),
        }
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Room::Personal(id) => write!(f, "user:{}", id),
            Room::Conversation(id) => write!(f, "conversation:{}", id),
        }
    }
}

/// Ids are limited to alphanumerics, dash, underscore and dot.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// One live connection. Owned by the gateway; handlers hold an `Arc`.
pub struct PresenceSession {
    pub connection_id: Uuid,
    pub user_id: String,
    pub connected_at: DateTime<Utc>,
    sender: mpsc::Sender<ServerMessage>,
    /// Unix millis, lock-free updates
    last_activity: AtomicI64,
    closing: AtomicBool,
    pub(super) rooms: DashSet<String>,
}

impl PresenceSession {
    pub(super) fn new(user_id: String, sender: mpsc::Sender<ServerMessage>) -> Self {
        let now = Utc::now();
        Self {
            connection_id: Uuid::new_v4(),
            user_id,
            connected_at: now,
            sender,
            last_activity: AtomicI64::new(now.timestamp_millis()),
            closing: AtomicBool::new(false),
            rooms: DashSet::new(),
        }
    }

    pub fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_activity.load(Ordering::Relaxed))
            .unwrap_or(self.connected_at)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub(super) fn mark_closing(&self) -> bool {
        !self.closing.swap(true, Ordering::AcqRel)
    }

    pub fn in_room(&self, room: &Room) -> bool {
        self.rooms.contains(&room.key())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Queue a message without waiting. A full queue means the client is
    /// not keeping up; the message is dropped and the caller falls back.
    pub fn push(&self, message: ServerMessage) -> bool {
        if self.is_closing() {
            return false;
        }
        self.sender.try_send(message).is_ok()
    }
}

impl fmt::Debug for PresenceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresenceSession")
            .field("connection_id", &self.connection_id)
            .field("user_id", &self.user_id)
            .field("closing", &self.is_closing())
            .finish()
    }
}

/// Result of a fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PushReport {
    pub delivered: usize,
    pub failed: usize,
}

impl PushReport {
    pub fn any_delivered(&self) -> bool {
        self.delivered > 0
    }

    pub(super) fn record(&mut self, ok: bool) {
        if ok {
            self.delivered += 1;
        } else {
            self.failed += 1;
        }
    }
}

/// Returned by `connect`
#[derive(Debug, Clone)]
pub struct Connected {
    pub session: std::sync::Arc<PresenceSession>,
    /// This is the user's first live session
    pub came_online: bool,
}

/// Returned by `disconnect` and the idle sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnected {
    pub connection_id: Uuid,
    pub user_id: String,
    /// That was the user's last session
    pub went_offline: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PresenceStats {
    pub sessions: usize,
    pub users_online: usize,
    pub rooms: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_names_round_trip() {
        assert_eq!(Room::personal("u1").key(), "user:u1");
        assert_eq!(Room::conversation("c-9").key(), "conversation:c-9");
        assert_eq!(Room::parse("conversation:c-9").unwrap(), Room::conversation("c-9"));
        assert!(Room::parse("channel:x").is_err());
        assert!(Room::parse("user:").is_err());
        assert!(Room::parse("conversation:a b").is_err());
    }

    #[tokio::test]
    async fn test_closing_session_refuses_pushes() {
        let (tx, mut rx) = mpsc::channel(4);
        let session = PresenceSession::new("u1".into(), tx);

        assert!(session.push(ServerMessage::Pong));
        assert!(session.mark_closing());
        assert!(!session.mark_closing());
        assert!(!session.push(ServerMessage::Pong));

        assert_eq!(rx.recv().await, Some(ServerMessage::Pong));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_full_queue_counts_as_failure() {
        let (tx, _rx) = mpsc::channel(1);
        let session = PresenceSession::new("u1".into(), tx);
        assert!(session.push(ServerMessage::Pong));
        assert!(!session.push(ServerMessage::Pong));
    }
}

//! Conversation membership.
//!
//! The gateway asks the directory before letting a session into a
//! conversation room; messaging asks it for the participant list.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::notification::DirectoryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Owner,
    Admin,
    #[default]
    Member,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMember {
    pub user_id: String,
    #[serde(default)]
    pub role: MemberRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl RoomMember {
    pub fn new(user_id: impl Into<String>, role: MemberRole) -> Self {
        Self {
            user_id: user_id.into(),
            role,
            last_seen: None,
        }
    }
}

#[async_trait]
pub trait RoomDirectory: Send + Sync {
    /// Participants of a conversation; unknown conversations have none.
    async fn members(&self, conversation_id: &str) -> Result<Vec<RoomMember>, DirectoryError>;

    async fn is_member(&self, conversation_id: &str, user_id: &str) -> Result<bool, DirectoryError> {
        Ok(self
            .members(conversation_id)
            .await?
            .iter()
            .any(|m| m.user_id == user_id))
    }

    /// Replace the participant list, keeping `last_seen` for members that stay.
    async fn set_members(&self, conversation_id: &str, members: Vec<RoomMember>) -> Result<(), DirectoryError>;

    async fn touch(&self, conversation_id: &str, user_id: &str, at: DateTime<Utc>) -> Result<(), DirectoryError>;

    /// Conversations a user participates in.
    async fn conversations_for(&self, user_id: &str) -> Result<Vec<String>, DirectoryError>;
}

#[derive(Default)]
pub struct MemoryRoomDirectory {
    conversations: DashMap<String, Vec<RoomMember>>,
}

impl MemoryRoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RoomDirectory for MemoryRoomDirectory {
    async fn members(&self, conversation_id: &str) -> Result<Vec<RoomMember>, DirectoryError> {
        Ok(self
            .conversations
            .get(conversation_id)
            .map(|m| m.clone())
            .unwrap_or_default())
    }

    async fn set_members(&self, conversation_id: &str, mut members: Vec<RoomMember>) -> Result<(), DirectoryError> {
        let mut seen = HashSet::new();
        members.retain(|m| seen.insert(m.user_id.clone()));
        let mut entry = self.conversations.entry(conversation_id.to_string()).or_default();
        for member in members.iter_mut() {
            if member.last_seen.is_none() {
                member.last_seen = entry
                    .iter()
                    .find(|m| m.user_id == member.user_id)
                    .and_then(|m| m.last_seen);
            }
        }
        *entry = members;
        Ok(())
    }

    async fn touch(&self, conversation_id: &str, user_id: &str, at: DateTime<Utc>) -> Result<(), DirectoryError> {
        if let Some(mut members) = self.conversations.get_mut(conversation_id) {
            if let Some(member) = members.iter_mut().find(|m| m.user_id == user_id) {
                member.last_seen = Some(at);
            }
        }
        Ok(())
    }

    async fn conversations_for(&self, user_id: &str) -> Result<Vec<String>, DirectoryError> {
        let mut ids: Vec<String> = self
            .conversations
            .iter()
            .filter(|entry| entry.value().iter().any(|m| m.user_id == user_id))
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_membership() {
        let rooms = MemoryRoomDirectory::new();
        rooms
            .set_members(
                "c1",
                vec![
                    RoomMember::new("alice", MemberRole::Owner),
                    RoomMember::new("bob", MemberRole::Member),
                ],
            )
            .await
            .unwrap();

        assert!(rooms.is_member("c1", "alice").await.unwrap());
        assert!(!rooms.is_member("c1", "mallory").await.unwrap());
        assert!(!rooms.is_member("c2", "alice").await.unwrap());
        assert_eq!(rooms.conversations_for("bob").await.unwrap(), vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn test_set_members_keeps_last_seen() {
        let rooms = MemoryRoomDirectory::new();
        rooms
            .set_members("c1", vec![RoomMember::new("alice", MemberRole::Owner)])
            .await
            .unwrap();
        let seen = Utc::now();
        rooms.touch("c1", "alice", seen).await.unwrap();

        rooms
            .set_members(
                "c1",
                vec![
                    RoomMember::new("alice", MemberRole::Owner),
                    RoomMember::new("carol", MemberRole::Member),
                ],
            )
            .await
            .unwrap();

        let members = rooms.members("c1").await.unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].last_seen, Some(seen));
        assert_eq!(members[1].last_seen, None);
    }
}

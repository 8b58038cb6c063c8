use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::PresenceConfig;
use crate::metrics::PresenceMetrics;
use crate::websocket::ServerMessage;

use super::rooms::RoomDirectory;
use super::types::{
    Connected, Disconnected, PresenceError, PresenceSession, PresenceStats, PushReport, Room,
};

#[derive(Debug, Clone, Copy)]
pub struct PresenceLimits {
    pub max_sessions_per_user: usize,
    pub max_rooms_per_session: usize,
}

impl Default for PresenceLimits {
    fn default() -> Self {
        Self {
            max_sessions_per_user: 5,
            max_rooms_per_session: 100,
        }
    }
}

impl From<&PresenceConfig> for PresenceLimits {
    fn from(config: &PresenceConfig) -> Self {
        Self {
            max_sessions_per_user: config.max_sessions_per_user.max(1),
            max_rooms_per_session: config.max_rooms_per_session.max(1),
        }
    }
}

/// Owns every live session and the user and room indexes over them.
///
/// All three maps are DashMaps; mutations for one user go through that
/// user's `user_index` entry, so connect and disconnect for the same user
/// serialize on its shard lock.
pub struct PresenceGateway {
    /// connection_id -> session
    sessions: DashMap<Uuid, Arc<PresenceSession>>,
    /// user_id -> connection ids
    user_index: DashMap<String, HashSet<Uuid>>,
    /// room key -> connection ids
    room_index: DashMap<String, HashSet<Uuid>>,
    rooms: Arc<dyn RoomDirectory>,
    limits: PresenceLimits,
}

impl PresenceGateway {
    pub fn new(rooms: Arc<dyn RoomDirectory>, limits: PresenceLimits) -> Self {
        Self {
            sessions: DashMap::new(),
            user_index: DashMap::new(),
            room_index: DashMap::new(),
            rooms,
            limits,
        }
    }

    pub fn rooms(&self) -> &Arc<dyn RoomDirectory> {
        &self.rooms
    }

    /// Register a session and put it in the user's personal room.
    pub fn connect(
        &self,
        user_id: &str,
        sender: mpsc::Sender<ServerMessage>,
    ) -> Result<Connected, PresenceError> {
        let session = Arc::new(PresenceSession::new(user_id.to_string(), sender));
        let connection_id = session.connection_id;

        let came_online = {
            let mut ids = self.user_index.entry(user_id.to_string()).or_default();
            if ids.len() >= self.limits.max_sessions_per_user {
                let empty = ids.is_empty();
                drop(ids);
                if empty {
                    self.user_index.remove_if(user_id, |_, ids| ids.is_empty());
                }
                return Err(PresenceError::SessionLimit {
                    user_id: user_id.to_string(),
                    max: self.limits.max_sessions_per_user,
                });
            }
            let first = ids.is_empty();
            ids.insert(connection_id);
            self.sessions.insert(connection_id, session.clone());
            first
        };

        self.index_room(&session, &Room::personal(user_id));
        self.update_gauges();

        tracing::info!(
            connection_id = %connection_id,
            user_id = %user_id,
            came_online,
            "Presence session registered"
        );

        Ok(Connected {
            session,
            came_online,
        })
    }

    /// Remove a session. The session is marked closing first so in-flight
    /// broadcasts skip it.
    pub fn disconnect(&self, connection_id: Uuid) -> Option<Disconnected> {
        let session = self.sessions.get(&connection_id).map(|s| s.clone())?;
        if !session.mark_closing() {
            return None;
        }

        let rooms: Vec<String> = session.rooms.iter().map(|r| r.clone()).collect();
        for room in rooms {
            self.unindex_room(&room, connection_id);
        }
        session.rooms.clear();

        let went_offline = match self.user_index.entry(session.user_id.clone()) {
            Entry::Occupied(mut ids) => {
                ids.get_mut().remove(&connection_id);
                self.sessions.remove(&connection_id);
                if ids.get().is_empty() {
                    ids.remove();
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(_) => {
                self.sessions.remove(&connection_id);
                true
            }
        };
        self.update_gauges();

        tracing::info!(
            connection_id = %connection_id,
            user_id = %session.user_id,
            went_offline,
            "Presence session removed"
        );

        Some(Disconnected {
            connection_id,
            user_id: session.user_id.clone(),
            went_offline,
        })
    }

    /// Join a room after checking membership.
    pub async fn join_room(&self, connection_id: Uuid, room: &Room) -> Result<(), PresenceError> {
        let session = self.session(connection_id)?;

        let allowed = match room {
            Room::Personal(owner) => owner == &session.user_id,
            Room::Conversation(conversation_id) => {
                self.rooms.is_member(conversation_id, &session.user_id).await?
            }
        };
        if !allowed {
            tracing::warn!(
                connection_id = %connection_id,
                user_id = %session.user_id,
                room = %room,
                "Unauthorized room join rejected"
            );
            return Err(PresenceError::NotMember {
                user_id: session.user_id.clone(),
                room: room.key(),
            });
        }

        if !session.in_room(room) && session.room_count() >= self.limits.max_rooms_per_session {
            return Err(PresenceError::RoomLimit {
                max: self.limits.max_rooms_per_session,
            });
        }

        self.index_room(&session, room);

        // A disconnect may have swept the rooms while membership was checked
        if session.is_closing() {
            self.unindex_room(&room.key(), connection_id);
            return Err(PresenceError::UnknownSession(connection_id));
        }

        if let Room::Conversation(conversation_id) = room {
            if let Err(e) = self.rooms.touch(conversation_id, &session.user_id, Utc::now()).await {
                tracing::debug!(error = %e, "Failed to record last_seen");
            }
        }

        tracing::debug!(connection_id = %connection_id, room = %room, "Joined room");
        Ok(())
    }

    pub fn leave_room(&self, connection_id: Uuid, room: &Room) -> bool {
        let key = room.key();
        let left = self
            .sessions
            .get(&connection_id)
            .map(|s| s.rooms.remove(&key).is_some())
            .unwrap_or(false);
        if left {
            self.unindex_room(&key, connection_id);
            tracing::debug!(connection_id = %connection_id, room = %room, "Left room");
        }
        left
    }

    /// Fan out to every session in a room. The member set is snapshotted
    /// first; closing sessions are skipped.
    pub fn broadcast(&self, room: &Room, message: &ServerMessage, exclude: Option<Uuid>) -> PushReport {
        let members: Vec<Uuid> = self
            .room_index
            .get(&room.key())
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();

        self.push_to(members, message, exclude)
    }

    /// Push to every session of a user through their personal room.
    pub fn send_to_user(&self, user_id: &str, message: &ServerMessage) -> PushReport {
        self.broadcast(&Room::personal(user_id), message, None)
    }

    pub fn send_to_connection(&self, connection_id: Uuid, message: ServerMessage) -> bool {
        self.sessions
            .get(&connection_id)
            .map(|s| s.push(message))
            .unwrap_or(false)
    }

    /// Push to every live session.
    pub fn broadcast_all(&self, message: &ServerMessage) -> PushReport {
        let all: Vec<Uuid> = self.sessions.iter().map(|s| *s.key()).collect();
        self.push_to(all, message, None)
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.user_index
            .get(user_id)
            .map(|ids| !ids.is_empty())
            .unwrap_or(false)
    }

    pub fn session_count(&self, user_id: &str) -> usize {
        self.user_index.get(user_id).map(|ids| ids.len()).unwrap_or(0)
    }

    pub fn get_session(&self, connection_id: Uuid) -> Option<Arc<PresenceSession>> {
        self.sessions.get(&connection_id).map(|s| s.clone())
    }

    pub fn touch(&self, connection_id: Uuid) {
        if let Some(session) = self.sessions.get(&connection_id) {
            session.touch();
        }
    }

    /// Evict sessions idle longer than `timeout`.
    pub fn sweep_idle(&self, timeout: Duration) -> Vec<Disconnected> {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();

        let stale: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|s| now.signed_duration_since(s.last_activity()) > timeout)
            .map(|s| *s.key())
            .collect();

        let evicted: Vec<Disconnected> = stale
            .into_iter()
            .filter_map(|id| {
                tracing::info!(connection_id = %id, "Evicting idle session");
                self.disconnect(id)
            })
            .collect();

        if !evicted.is_empty() {
            PresenceMetrics::record_evictions(evicted.len());
        }
        evicted
    }

    pub fn stats(&self) -> PresenceStats {
        PresenceStats {
            sessions: self.sessions.len(),
            users_online: self.user_index.len(),
            rooms: self.room_index.len(),
        }
    }

    fn session(&self, connection_id: Uuid) -> Result<Arc<PresenceSession>, PresenceError> {
        self.sessions
            .get(&connection_id)
            .map(|s| s.clone())
            .filter(|s| !s.is_closing())
            .ok_or(PresenceError::UnknownSession(connection_id))
    }

    fn index_room(&self, session: &PresenceSession, room: &Room) {
        let key = room.key();
        session.rooms.insert(key.clone());
        self.room_index
            .entry(key)
            .or_default()
            .insert(session.connection_id);
    }

    fn unindex_room(&self, key: &str, connection_id: Uuid) {
        if let Some(mut ids) = self.room_index.get_mut(key) {
            ids.remove(&connection_id);
        }
        self.room_index.remove_if(key, |_, ids| ids.is_empty());
    }

    fn push_to(&self, targets: Vec<Uuid>, message: &ServerMessage, exclude: Option<Uuid>) -> PushReport {
        let mut report = PushReport::default();
        for id in targets {
            if Some(id) == exclude {
                continue;
            }
            let Some(session) = self.sessions.get(&id).map(|s| s.clone()) else {
                continue;
            };
            if session.is_closing() {
                continue;
            }
            report.record(session.push(message.clone()));
        }
        PresenceMetrics::record_push(report.delivered, report.failed);
        report
    }

    fn update_gauges(&self) {
        PresenceMetrics::set_sessions(self.sessions.len(), self.user_index.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::{MemberRole, MemoryRoomDirectory, RoomMember};

    async fn gateway() -> PresenceGateway {
        let rooms = Arc::new(MemoryRoomDirectory::new());
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
        PresenceGateway::new(
            rooms,
            PresenceLimits {
                max_sessions_per_user: 2,
                max_rooms_per_session: 3,
            },
        )
    }

    #[tokio::test]
    async fn test_first_and_last_session_flags() {
        let gateway = gateway().await;
        let (tx1, _rx1) = mpsc::channel(8);
        let (tx2, _rx2) = mpsc::channel(8);

        let first = gateway.connect("alice", tx1).unwrap();
        let second = gateway.connect("alice", tx2).unwrap();
        assert!(first.came_online);
        assert!(!second.came_online);
        assert_eq!(gateway.session_count("alice"), 2);

        let gone = gateway.disconnect(first.session.connection_id).unwrap();
        assert!(!gone.went_offline);
        let gone = gateway.disconnect(second.session.connection_id).unwrap();
        assert!(gone.went_offline);
        assert!(!gateway.is_online("alice"));
        assert_eq!(gateway.stats().rooms, 0);
    }

    #[tokio::test]
    async fn test_session_limit() {
        let gateway = gateway().await;
        let mut receivers = Vec::new();
        for _ in 0..2 {
            let (tx, rx) = mpsc::channel(8);
            receivers.push(rx);
            gateway.connect("alice", tx).unwrap();
        }
        let (tx, _rx) = mpsc::channel(8);
        assert!(matches!(
            gateway.connect("alice", tx),
            Err(PresenceError::SessionLimit { .. })
        ));
    }

    #[tokio::test]
    async fn test_personal_room_push() {
        let gateway = gateway().await;
        let (tx, mut rx) = mpsc::channel(8);
        gateway.connect("alice", tx).unwrap();

        let report = gateway.send_to_user("alice", &ServerMessage::Heartbeat);
        assert_eq!(report.delivered, 1);
        assert_eq!(rx.recv().await, Some(ServerMessage::Heartbeat));

        assert_eq!(gateway.send_to_user("bob", &ServerMessage::Heartbeat).delivered, 0);
    }

    #[tokio::test]
    async fn test_join_requires_membership() {
        let gateway = gateway().await;
        let (tx, _rx) = mpsc::channel(8);
        let mallory = gateway.connect("mallory", tx).unwrap().session;

        let err = gateway
            .join_room(mallory.connection_id, &Room::conversation("c1"))
            .await
            .unwrap_err();
        assert!(matches!(err, PresenceError::NotMember { .. }));

        let err = gateway
            .join_room(mallory.connection_id, &Room::personal("alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, PresenceError::NotMember { .. }));
    }

    #[tokio::test]
    async fn test_room_broadcast_is_fifo_and_skips_excluded() {
        let gateway = gateway().await;
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let alice = gateway.connect("alice", tx_a).unwrap().session;
        let bob = gateway.connect("bob", tx_b).unwrap().session;

        let room = Room::conversation("c1");
        gateway.join_room(alice.connection_id, &room).await.unwrap();
        gateway.join_room(bob.connection_id, &room).await.unwrap();

        for i in 0..3 {
            let msg = ServerMessage::error("SEQ", i.to_string());
            gateway.broadcast(&room, &msg, Some(alice.connection_id));
        }

        for i in 0..3 {
            assert_eq!(rx_b.recv().await, Some(ServerMessage::error("SEQ", i.to_string())));
        }
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnected_session_is_skipped() {
        let gateway = gateway().await;
        let (tx, _rx) = mpsc::channel(8);
        let alice = gateway.connect("alice", tx).unwrap().session;
        let room = Room::conversation("c1");
        gateway.join_room(alice.connection_id, &room).await.unwrap();

        gateway.disconnect(alice.connection_id);
        assert_eq!(gateway.broadcast(&room, &ServerMessage::Pong, None), PushReport::default());
        assert!(gateway
            .join_room(alice.connection_id, &room)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_room_limit() {
        let gateway = gateway().await;
        let rooms = gateway.rooms().clone();
        for id in ["c2", "c3"] {
            rooms
                .set_members(id, vec![RoomMember::new("alice", MemberRole::Member)])
                .await
                .unwrap();
        }
        let (tx, _rx) = mpsc::channel(8);
        let alice = gateway.connect("alice", tx).unwrap().session;

        // personal room counts toward the limit of 3
        gateway.join_room(alice.connection_id, &Room::conversation("c1")).await.unwrap();
        gateway.join_room(alice.connection_id, &Room::conversation("c2")).await.unwrap();
        let err = gateway
            .join_room(alice.connection_id, &Room::conversation("c3"))
            .await
            .unwrap_err();
        assert!(matches!(err, PresenceError::RoomLimit { max: 3 }));
    }

    #[tokio::test]
    async fn test_sweep_idle_evicts() {
        let gateway = gateway().await;
        let (tx, _rx) = mpsc::channel(8);
        gateway.connect("alice", tx).unwrap();

        assert!(gateway.sweep_idle(Duration::from_secs(300)).is_empty());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let evicted = gateway.sweep_idle(Duration::from_millis(1));
        assert_eq!(evicted.len(), 1);
        assert!(evicted[0].went_offline);
        assert!(!gateway.is_online("alice"));
    }
}

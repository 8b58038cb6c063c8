//! Real-time presence.
//!
//! Tracks live sessions per user, the rooms they have joined, and pushes
//! server messages to them. Personal rooms (`user:{id}`) are joined on
//! connect; conversation rooms require membership in the [`RoomDirectory`].

mod gateway;
mod rooms;
mod types;

pub use gateway::{PresenceGateway, PresenceLimits};
pub use rooms::{MemberRole, MemoryRoomDirectory, RoomDirectory, RoomMember};
pub use types::{
    is_valid_id, Connected, Disconnected, PresenceError, PresenceSession, PresenceStats,
    PushReport, Room,
};

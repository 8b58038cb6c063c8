//! In-memory inbox backend using DashMap.
//!
//! Notifications are lost on restart. Used for tests and single-node runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::notification::{ApprovalStatus, Notification, NotificationKind};

use super::backend::{InboxBackend, InboxError, InboxStats, RetentionPolicy};

pub struct MemoryInboxBackend {
    notifications: DashMap<Uuid, Notification>,
    /// Per-user ids in insertion order
    by_user: DashMap<String, Vec<Uuid>>,
    unread: DashMap<String, u64>,
}

impl MemoryInboxBackend {
    pub fn new() -> Self {
        Self {
            notifications: DashMap::new(),
            by_user: DashMap::new(),
            unread: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.notifications.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifications.is_empty()
    }

    /// All notifications stored for a user, in insertion order.
    pub fn for_user(&self, user_id: &str) -> Vec<Notification> {
        self.user_ids(user_id)
            .into_iter()
            .filter_map(|id| self.notifications.get(&id).map(|n| n.clone()))
            .collect()
    }

    fn user_ids(&self, user_id: &str) -> Vec<Uuid> {
        self.by_user
            .get(user_id)
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }

    fn decrement_unread(&self, user_id: &str) {
        if let Some(mut count) = self.unread.get_mut(user_id) {
            *count = count.saturating_sub(1);
        }
    }
}

impl Default for MemoryInboxBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InboxBackend for MemoryInboxBackend {
    async fn insert(&self, notification: &Notification) -> Result<(), InboxError> {
        match self.notifications.entry(notification.id) {
            Entry::Occupied(_) => return Err(InboxError::Duplicate(notification.id)),
            Entry::Vacant(slot) => {
                slot.insert(notification.clone());
            }
        }

        // The counter entry is held while the id is indexed so a concurrent
        // mark_all_read recount sees both or neither.
        let mut unread = self.unread.entry(notification.recipient_id.clone()).or_insert(0);
        self.by_user
            .entry(notification.recipient_id.clone())
            .or_default()
            .push(notification.id);
        if !notification.is_read {
            *unread += 1;
        }
        drop(unread);

        tracing::trace!(
            notification_id = %notification.id,
            recipient_id = %notification.recipient_id,
            "Notification stored in memory inbox"
        );
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Notification>, InboxError> {
        Ok(self.notifications.get(&id).map(|n| n.clone()))
    }

    async fn undelivered(&self, user_id: &str, limit: usize) -> Result<Vec<Notification>, InboxError> {
        let mut pending: Vec<Notification> = self
            .user_ids(user_id)
            .into_iter()
            .filter_map(|id| {
                self.notifications
                    .get(&id)
                    .filter(|n| !n.delivered)
                    .map(|n| n.clone())
            })
            .collect();
        pending.sort_by_key(|n| n.created_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_delivered(&self, user_id: &str, ids: &[Uuid]) -> Result<usize, InboxError> {
        let mut changed = 0;
        for id in ids {
            if let Some(mut notification) = self.notifications.get_mut(id) {
                if notification.recipient_id == user_id && !notification.delivered {
                    notification.delivered = true;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn mark_read(&self, user_id: &str, id: Uuid) -> Result<bool, InboxError> {
        let changed = {
            let mut notification = self
                .notifications
                .get_mut(&id)
                .filter(|n| n.recipient_id == user_id)
                .ok_or(InboxError::NotFound(id))?;
            if notification.is_read {
                false
            } else {
                notification.is_read = true;
                notification.read_at = Some(Utc::now());
                true
            }
        };

        if changed {
            self.decrement_unread(user_id);
        }
        Ok(changed)
    }

    async fn mark_all_read(&self, user_id: &str) -> Result<usize, InboxError> {
        let now = Utc::now();
        let mut changed = 0;
        let mut unread = self.unread.entry(user_id.to_string()).or_insert(0);
        for id in self.user_ids(user_id) {
            if let Some(mut notification) = self.notifications.get_mut(&id) {
                if !notification.is_read {
                    notification.is_read = true;
                    notification.read_at = Some(now);
                    changed += 1;
                }
            }
        }
        // Inserts for this user wait on the counter entry, so the recount
        // is exact
        *unread = self
            .user_ids(user_id)
            .into_iter()
            .filter(|id| self.notifications.get(id).is_some_and(|n| !n.is_read))
            .count() as u64;
        Ok(changed)
    }

    async fn unread_count(&self, user_id: &str) -> Result<u64, InboxError> {
        Ok(self.unread.get(user_id).map(|c| *c).unwrap_or(0))
    }

    async fn resolve_guardian_status(&self, id: Uuid, next: ApprovalStatus) -> Result<bool, InboxError> {
        let mut notification = self.notifications.get_mut(&id).ok_or(InboxError::NotFound(id))?;
        match &mut notification.kind {
            NotificationKind::Guardian {
                status,
                requires_action,
                ..
            } if status.can_transition_to(next) => {
                *status = next;
                *requires_action = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cleanup_expired(&self, retention: &RetentionPolicy, now: DateTime<Utc>) -> Result<usize, InboxError> {
        let expired: Vec<(Uuid, String)> = self
            .notifications
            .iter()
            .filter(|entry| retention.is_expired(entry.value(), now))
            .map(|entry| (*entry.key(), entry.recipient_id.clone()))
            .collect();

        let mut removed = 0;
        for (id, user_id) in expired {
            let Some((_, notification)) = self.notifications.remove(&id) else {
                continue;
            };
            removed += 1;
            if let Some(mut ids) = self.by_user.get_mut(&user_id) {
                ids.retain(|existing| *existing != id);
            }
            if !notification.is_read {
                self.decrement_unread(&user_id);
            }
        }
        self.by_user.retain(|_, ids| !ids.is_empty());

        Ok(removed)
    }

    async fn stats(&self) -> Result<InboxStats, InboxError> {
        let mut undelivered = 0;
        let mut unread = 0;
        for entry in self.notifications.iter() {
            if !entry.delivered {
                undelivered += 1;
            }
            if !entry.is_read {
                unread += 1;
            }
        }

        Ok(InboxStats {
            backend_type: self.name().to_string(),
            total_notifications: self.notifications.len(),
            undelivered,
            unread,
            users: self.by_user.len(),
        })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

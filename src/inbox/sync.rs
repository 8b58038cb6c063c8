//! Pull-based catch-up shared by the WebSocket `sync` message and the HTTP
//! surface. A batch is handed out without being marked; the client acks what
//! it actually received, so a dropped batch is served again.

use serde::Serialize;

use crate::metrics::InboxMetrics;
use crate::notification::Notification;

use super::backend::{InboxBackend, InboxError};

#[derive(Debug, Clone, Serialize)]
pub struct SyncBatch {
    pub notifications: Vec<Notification>,
    pub unread_count: u64,
    pub has_more: bool,
}

/// Oldest undelivered notifications for `user_id`, at most `limit` of them
/// (clamped to `1..=max_limit`).
pub async fn pull_undelivered(
    inbox: &dyn InboxBackend,
    user_id: &str,
    limit: Option<usize>,
    max_limit: usize,
) -> Result<SyncBatch, InboxError> {
    let max_limit = max_limit.max(1);
    let limit = limit.unwrap_or(max_limit).clamp(1, max_limit);

    // One extra row tells us whether another page exists
    let mut notifications = inbox.undelivered(user_id, limit + 1).await?;
    let has_more = notifications.len() > limit;
    notifications.truncate(limit);

    let unread_count = inbox.unread_count(user_id).await?;
    InboxMetrics::record_synced(notifications.len());

    Ok(SyncBatch {
        notifications,
        unread_count,
        has_more,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::tests::sample_notification;
    use crate::inbox::MemoryInboxBackend;

    #[tokio::test]
    async fn test_pages_until_acked() {
        let inbox = MemoryInboxBackend::new();
        for _ in 0..3 {
            inbox.insert(&sample_notification("bob")).await.unwrap();
        }

        let first = pull_undelivered(&inbox, "bob", Some(2), 100).await.unwrap();
        assert_eq!(first.notifications.len(), 2);
        assert!(first.has_more);
        assert_eq!(first.unread_count, 3);

        // Not acked yet: the same page comes back
        let again = pull_undelivered(&inbox, "bob", Some(2), 100).await.unwrap();
        assert_eq!(again.notifications[0].id, first.notifications[0].id);

        let ids: Vec<_> = first.notifications.iter().map(|n| n.id).collect();
        inbox.mark_delivered("bob", &ids).await.unwrap();

        let rest = pull_undelivered(&inbox, "bob", None, 100).await.unwrap();
        assert_eq!(rest.notifications.len(), 1);
        assert!(!rest.has_more);
    }

    #[tokio::test]
    async fn test_limit_is_clamped() {
        let inbox = MemoryInboxBackend::new();
        for _ in 0..5 {
            inbox.insert(&sample_notification("bob")).await.unwrap();
        }
        let batch = pull_undelivered(&inbox, "bob", Some(1_000), 3).await.unwrap();
        assert_eq!(batch.notifications.len(), 3);
        assert!(batch.has_more);

        let batch = pull_undelivered(&inbox, "bob", Some(0), 3).await.unwrap();
        assert_eq!(batch.notifications.len(), 1);
    }
}

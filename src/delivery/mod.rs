//! Delivery router and secondary channel dispatchers.

mod dispatcher;
mod router;

pub use dispatcher::{
    create_dispatcher, ChannelDispatcher, DispatchError, LoggingDispatcher, WebhookDispatcher,
};
pub use router::{DeliveryRouter, RouteOutcome};

#[cfg(test)]
pub(crate) mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use crate::notification::{
        ChannelSet, Notification, NotificationKind, NotificationType, Priority,
    };

    pub fn sample_notification(recipient_id: &str) -> Notification {
        Notification {
            id: Uuid::new_v4(),
            notification_type: NotificationType::PostLiked,
            recipient_id: recipient_id.to_string(),
            sender_id: Some("actor".into()),
            title: "New like".into(),
            message: "actor liked your post".into(),
            created_at: Utc::now(),
            read_at: None,
            is_read: false,
            delivered: false,
            priority: Priority::Low,
            channels: ChannelSet::in_app_only(),
            metadata: serde_json::Map::new(),
            source_event_id: Uuid::new_v4(),
            kind: NotificationKind::Social,
        }
    }
}

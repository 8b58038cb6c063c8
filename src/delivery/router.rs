use std::sync::Arc;
use std::time::Instant;

use tracing::instrument;

use crate::error::NotifyError;
use crate::inbox::{InboxBackend, InboxError};
use crate::metrics::{InboxMetrics, PresenceMetrics};
use crate::notification::{Channel, Notification};
use crate::presence::{PresenceGateway, Room};
use crate::websocket::ServerMessage;

use super::dispatcher::{dispatch_and_record, ChannelDispatcher};

/// What `route` did with a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Already in the inbox; nothing was pushed or dispatched
    Duplicate,
    Stored {
        /// Pushed to at least one live session and marked delivered
        pushed: bool,
        /// Secondary channels handed to the dispatcher
        dispatched: usize,
    },
}

impl RouteOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, RouteOutcome::Duplicate)
    }
}

/// Persists notifications and fans them out to their channels.
///
/// The inbox insert is the dedup point: only the first insert of a given
/// id pushes or dispatches anything.
pub struct DeliveryRouter {
    inbox: Arc<dyn InboxBackend>,
    presence: Arc<PresenceGateway>,
    dispatcher: Arc<dyn ChannelDispatcher>,
}

impl DeliveryRouter {
    pub fn new(
        inbox: Arc<dyn InboxBackend>,
        presence: Arc<PresenceGateway>,
        dispatcher: Arc<dyn ChannelDispatcher>,
    ) -> Self {
        Self {
            inbox,
            presence,
            dispatcher,
        }
    }

    pub fn inbox(&self) -> &Arc<dyn InboxBackend> {
        &self.inbox
    }

    pub fn presence(&self) -> &Arc<PresenceGateway> {
        &self.presence
    }

    #[instrument(
        name = "router.route",
        skip(self, notification),
        fields(
            notification_id = %notification.id,
            recipient_id = %notification.recipient_id,
            notification_type = %notification.notification_type
        )
    )]
    pub async fn route(&self, notification: &Notification) -> Result<RouteOutcome, NotifyError> {
        let start = Instant::now();

        match self.inbox.insert(notification).await {
            Ok(()) => InboxMetrics::record_insert("stored"),
            Err(InboxError::Duplicate(id)) => {
                InboxMetrics::record_insert("duplicate");
                tracing::debug!(notification_id = %id, "Notification already stored");
                return Ok(RouteOutcome::Duplicate);
            }
            Err(e) => {
                InboxMetrics::record_insert("failed");
                return Err(e.into());
            }
        }

        let mut pushed = false;
        let mut dispatched = 0;

        for channel in notification.channels.iter() {
            match channel {
                Channel::InApp => match self.push_in_app(notification).await {
                    Ok(delivered) => pushed = delivered,
                    Err(e) => tracing::info!(error = %e, "Left in inbox for later sync"),
                },
                other => {
                    self.spawn_dispatch(other, notification.clone());
                    dispatched += 1;
                }
            }
        }

        PresenceMetrics::record_route_latency(start.elapsed().as_secs_f64());
        Ok(RouteOutcome::Stored { pushed, dispatched })
    }

    /// Push to every live session of the recipient. An offline recipient or
    /// a failed push is a `PresenceRoutingFailure`; the notification stays
    /// undelivered in the inbox.
    async fn push_in_app(&self, notification: &Notification) -> Result<bool, NotifyError> {
        let recipient = &notification.recipient_id;
        if !self.presence.is_online(recipient) {
            return Err(NotifyError::PresenceRoutingFailure {
                user_id: recipient.clone(),
                reason: "no live session".into(),
            });
        }

        let report = self.presence.broadcast(
            &Room::personal(recipient.as_str()),
            &ServerMessage::notification(notification.clone()),
            None,
        );
        if !report.any_delivered() {
            return Err(NotifyError::PresenceRoutingFailure {
                user_id: recipient.clone(),
                reason: format!("{} session queues refused the push", report.failed),
            });
        }

        if let Err(e) = self.inbox.mark_delivered(recipient, &[notification.id]).await {
            // The client has it; a later sync will redeliver and the client dedups by id
            tracing::warn!(error = %e, "Failed to mark pushed notification delivered");
        }
        Ok(true)
    }

    fn spawn_dispatch(&self, channel: Channel, notification: Notification) {
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatch_and_record(dispatcher.as_ref(), channel, &notification).await {
                tracing::warn!(
                    notification_id = %notification.id,
                    error = %e,
                    "Secondary channel dispatch failed"
                );
            }
        });
    }
}

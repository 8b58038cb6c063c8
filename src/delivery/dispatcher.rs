//! Secondary channel handoff (push, email, sms).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;

use crate::config::DispatchConfig;
use crate::error::NotifyError;
use crate::metrics::DispatchMetrics;
use crate::notification::{Channel, Notification};

/// Delays between webhook attempts.
const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("provider returned HTTP {0}")]
    HttpStatus(u16),

    #[error("channel {0} is not handled by this dispatcher")]
    Unsupported(Channel),
}

impl DispatchError {
    pub fn into_notify(self, channel: Channel) -> NotifyError {
        NotifyError::ChannelDispatchFailure {
            channel,
            reason: self.to_string(),
        }
    }
}

/// Hands a notification to an out-of-band channel. Implementations own
/// their retries and timeouts.
#[async_trait]
pub trait ChannelDispatcher: Send + Sync {
    async fn dispatch(&self, channel: Channel, notification: &Notification) -> Result<(), DispatchError>;

    fn name(&self) -> &'static str;
}

/// Logs instead of sending. Used when no provider gateway is configured.
#[derive(Debug, Default)]
pub struct LoggingDispatcher;

#[async_trait]
impl ChannelDispatcher for LoggingDispatcher {
    async fn dispatch(&self, channel: Channel, notification: &Notification) -> Result<(), DispatchError> {
        if channel == Channel::InApp {
            return Err(DispatchError::Unsupported(channel));
        }
        tracing::info!(
            notification_id = %notification.id,
            recipient_id = %notification.recipient_id,
            channel = channel.as_str(),
            notification_type = %notification.notification_type,
            "Channel dispatch (logged)"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "logging"
    }
}

/// POSTs each dispatch to a provider gateway.
pub struct WebhookDispatcher {
    client: reqwest::Client,
    url: String,
    retry_delays: Vec<Duration>,
}

impl WebhookDispatcher {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            retry_delays: RETRY_DELAYS.to_vec(),
        })
    }

    pub fn with_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.retry_delays = delays;
        self
    }

    async fn try_send(&self, payload: &serde_json::Value) -> Result<(), DispatchError> {
        let response = self.client.post(&self.url).json(payload).send().await?;
        if !response.status().is_success() {
            return Err(DispatchError::HttpStatus(response.status().as_u16()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelDispatcher for WebhookDispatcher {
    async fn dispatch(&self, channel: Channel, notification: &Notification) -> Result<(), DispatchError> {
        if channel == Channel::InApp {
            return Err(DispatchError::Unsupported(channel));
        }
        let payload = json!({
            "channel": channel.as_str(),
            "notification": notification,
        });

        let mut result = self.try_send(&payload).await;
        for (attempt, delay) in self.retry_delays.iter().enumerate() {
            let Err(e) = &result else { break };
            tracing::warn!(
                attempt = attempt + 1,
                channel = channel.as_str(),
                notification_id = %notification.id,
                error = %e,
                "Channel dispatch attempt failed, retrying"
            );
            tokio::time::sleep(*delay).await;
            result = self.try_send(&payload).await;
        }

        if let Err(e) = &result {
            tracing::error!(
                channel = channel.as_str(),
                notification_id = %notification.id,
                error = %e,
                "Channel dispatch failed after all retries"
            );
        }
        result
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}

/// Webhook when a gateway URL is configured, logging otherwise.
pub fn create_dispatcher(config: &DispatchConfig) -> Arc<dyn ChannelDispatcher> {
    let Some(url) = config.webhook_url.as_deref().filter(|u| !u.is_empty()) else {
        tracing::info!("No dispatch webhook configured, secondary channels are logged");
        return Arc::new(LoggingDispatcher);
    };

    match WebhookDispatcher::new(url, Duration::from_secs(config.timeout_secs.max(1))) {
        Ok(dispatcher) => {
            tracing::info!(url = %url, "Using webhook channel dispatcher");
            Arc::new(dispatcher)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to build webhook dispatcher, falling back to logging");
            Arc::new(LoggingDispatcher)
        }
    }
}

/// Run one channel dispatch and record the outcome.
pub(super) async fn dispatch_and_record(
    dispatcher: &dyn ChannelDispatcher,
    channel: Channel,
    notification: &Notification,
) -> Result<(), NotifyError> {
    match dispatcher.dispatch(channel, notification).await {
        Ok(()) => {
            DispatchMetrics::record_success(channel.as_str());
            Ok(())
        }
        Err(e) => {
            DispatchMetrics::record_failure(channel.as_str());
            Err(e.into_notify(channel))
        }
    }
}

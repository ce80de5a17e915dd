use crate::config::toml::DeliveryConfigToml;
use async_trait::async_trait;
use concepts::{Container, Subscriber, SubscriberType, UserId, WorkspaceId};
use notifier::{Delivery, DeliveryError, RenderedNotification};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

pub(crate) fn from_config(config: &DeliveryConfigToml) -> Result<Arc<dyn Delivery>, anyhow::Error> {
    Ok(match config {
        DeliveryConfigToml::Log => Arc::new(LogDelivery),
        DeliveryConfigToml::Webhook { url, timeout } => {
            Arc::new(WebhookDelivery::new(url.clone(), (*timeout).into())?)
        }
    })
}

/// Writes the digest to the log.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LogDelivery;

#[async_trait]
impl Delivery for LogDelivery {
    async fn deliver(
        &self,
        container: &Container,
        subscriber: &Subscriber,
        notification: &RenderedNotification,
    ) -> Result<(), DeliveryError> {
        info!(
            workspace_id = %container.workspace_id,
            subscriber_id = %subscriber.subscriber_id,
            subscriber_type = %subscriber.subscriber_type,
            "{}",
            notification.to_markdown()
        );
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    workspace_id: &'a WorkspaceId,
    subscriber_id: &'a UserId,
    subscriber_type: SubscriberType,
    title: &'a str,
    text: String,
}

#[derive(Debug, Clone)]
pub(crate) struct WebhookDelivery {
    client: reqwest::Client,
    url: reqwest::Url,
}

impl WebhookDelivery {
    pub(crate) fn new(url: reqwest::Url, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Delivery for WebhookDelivery {
    #[instrument(level = "debug", skip_all, fields(url = %self.url, subscriber_id = %subscriber.subscriber_id))]
    async fn deliver(
        &self,
        container: &Container,
        subscriber: &Subscriber,
        notification: &RenderedNotification,
    ) -> Result<(), DeliveryError> {
        let payload = WebhookPayload {
            workspace_id: &container.workspace_id,
            subscriber_id: &subscriber.subscriber_id,
            subscriber_type: subscriber.subscriber_type,
            title: &notification.title,
            text: notification.to_markdown(),
        };
        let resp = self
            .client
            .post(self.url.clone())
            .json(&payload)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    DeliveryError::Timeout
                } else {
                    DeliveryError::Transport(err.to_string())
                }
            })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DeliveryError::Rejected(format!(
                "webhook responded with {status}"
            )));
        }
        debug!(%status, "Delivered");
        Ok(())
    }
}

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use crate::domain::Notification;
use crate::domain::NotificationKind;
use crate::error::CoreError;

/// Chat-card sink for `Notifier`. Deliberately carries no
/// `CircuitBreaker`/`RetryPolicy`: notifications are best-effort and the
/// caller swallows every error, so wrapping this in resilience machinery
/// meant for redelivery would be dead weight.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn post(&self, notification: &Notification) -> Result<(), CoreError>;
}

pub struct HttpNotificationSink {
    client: Client,
    webhook_url: String,
}

impl HttpNotificationSink {
    pub fn new(webhook_url: String, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build notification sink http client");
        Self { client, webhook_url }
    }
}

fn color_for(kind: NotificationKind) -> &'static str {
    match kind {
        NotificationKind::Success => "good",
        NotificationKind::Unknown => "warning",
        NotificationKind::Error => "danger",
    }
}

#[async_trait]
impl NotificationSink for HttpNotificationSink {
    async fn post(&self, notification: &Notification) -> Result<(), CoreError> {
        let card = json!({
            "title": notification.summary,
            "color": color_for(notification.kind),
            "fields": notification.details,
            "tx_id": notification.tx_id.to_string(),
        });

        let response = self
            .client
            .post(&self.webhook_url)
            .json(&card)
            .send()
            .await
            .map_err(|e| CoreError::Transient(e.into()))?;

        if !response.status().is_success() {
            return Err(CoreError::Transient(anyhow::anyhow!(
                "notification sink returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

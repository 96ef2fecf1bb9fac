//! Panic-notification gateway
//!
//! Alarm events from devices whose owner has a notification address are
//! forwarded to an external webhook. Delivery is best-effort: a failed
//! or slow call is logged and never blocks ingestion.

use async_trait::async_trait;
use fleetgate_core::config::NotifierConfig;
use fleetgate_core::{Error, Result};
use std::time::Duration;
use tracing::{info, warn};

/// Where alarm notifications go
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one message to an address.
    async fn notify(&self, address: &str, message: &str) -> Result<()>;
}

/// Notifier that drops everything; used when no gateway is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, address: &str, message: &str) -> Result<()> {
        info!(address, message, "notification gateway disabled, dropping");
        Ok(())
    }
}

/// Webhook-backed notifier
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl WebhookNotifier {
    /// Build a notifier from config; `None` when no URL is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn from_config(config: &NotifierConfig) -> Result<Option<Self>> {
        let Some(url) = config.webhook_url.clone() else {
            return Ok(None);
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Notification(e.to_string()))?;
        Ok(Some(Self {
            client,
            url,
            token: config.token.clone(),
        }))
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, address: &str, message: &str) -> Result<()> {
        let body = serde_json::json!({
            "to": address,
            "message": message,
        });
        let mut request = self.client.post(&self.url).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Notification(e.to_string()))?;
        if !response.status().is_success() {
            warn!(status = %response.status(), address, "notification gateway refused message");
            return Err(Error::Notification(format!(
                "gateway returned {}",
                response.status()
            )));
        }
        metrics::counter!("fleetgate_notifications_sent_total").increment(1);
        Ok(())
    }
}

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::{Notification, Notifier};
use crate::config::WebhookConfig;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Trackdesk-Signature";

/// Generic JSON webhook. Bodies are signed with HMAC-SHA256 when a secret is set.
pub struct WebhookNotifier {
    config: WebhookConfig,
    secret: Option<String>,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn from_config(config: &WebhookConfig, client: reqwest::Client) -> Self {
        let secret = config.secret_env.as_deref().and_then(|var| match std::env::var(var) {
            Ok(secret) if !secret.is_empty() => Some(secret),
            _ => {
                tracing::warn!(webhook = %config.name, env = var, "webhook secret env var is unset, sending unsigned");
                None
            }
        });

        Self {
            config: config.clone(),
            secret,
            client,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn accepts(&self, channel: Option<&str>) -> bool {
        self.config.accepts(channel)
    }

    async fn send(&self, notification: &Notification) -> Result<(), String> {
        let body = serde_json::to_vec(notification)
            .map_err(|e| format!("json serialization failed: {}", e))?;

        let mut request = self
            .client
            .post(&self.config.url)
            .header("Content-Type", "application/json")
            .header("User-Agent", concat!("trackdesk-webhook/", env!("CARGO_PKG_VERSION")));

        if let Some(secret) = &self.secret {
            let signature = compute_signature(secret.as_bytes(), &body)?;
            request = request.header(SIGNATURE_HEADER, format!("sha256={}", signature));
        }

        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| format!("webhook request failed: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("webhook returned {}: {}", status, body));
        }

        Ok(())
    }
}

pub fn compute_signature(secret: &[u8], body: &[u8]) -> Result<String, String> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|e| format!("invalid hmac key: {}", e))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

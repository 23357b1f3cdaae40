//! Slack incoming-webhook backend.

use async_trait::async_trait;
use serde_json::json;

use super::Notifier;
use crate::error::{ConfigError, DeliveryError};

const BACKEND: &str = "slack";

pub struct SlackNotifier {
    client: reqwest::Client,
    webhook_url: String,
}

impl SlackNotifier {
    pub fn new(webhook_url: &str) -> Result<Self, ConfigError> {
        // ---
        let url = webhook_url.trim();
        if !url.starts_with("https://") && !url.starts_with("http://") {
            return Err(ConfigError::invalid("SLACK_WEBHOOK_URL", "must be an http(s) URL"));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            webhook_url: url.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    fn name(&self) -> &str {
        BACKEND
    }

    async fn send(&self, subject: &str, body: &str) -> Result<(), DeliveryError> {
        // ---
        let payload = json!({ "text": format!("*{subject}*\n{body}") });
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .map_err(|source| DeliveryError::Http {
                backend: BACKEND,
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Rejected {
                backend: BACKEND,
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

//! Operator notifications.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{error, info, warn};

const TELEGRAM_API: &str = "https://api.telegram.org";

/// Sink for messages the operator should see.
///
/// Delivery is best effort: implementations log failures instead of
/// returning them so a dead chat never stalls trading.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str);
}

/// Writes notifications to the log only.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str) {
        info!(message = %message, "Operator notification");
    }
}

/// Sends notifications to a Telegram chat.
pub struct TelegramNotifier {
    http: Client,
    base_url: String,
    token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(token: &str, chat_id: &str) -> Result<Self> {
        Self::with_base_url(TELEGRAM_API, token, chat_id)
    }

    /// Create with custom base URL (for testing).
    pub fn with_base_url(base_url: &str, token: &str, chat_id: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            chat_id: chat_id.to_string(),
        })
    }

    async fn send(&self, message: &str) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.base_url, self.token);
        let resp = self
            .http
            .post(&url)
            .json(&json!({ "chat_id": self.chat_id, "text": message }))
            .send()
            .await
            .context("sendMessage request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("sendMessage failed: {} - {}", status, body);
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, message: &str) {
        if let Err(e) = self.send(message).await {
            error!(error = %e, "Failed to send Telegram message");
        }
    }
}

/// Telegram notifier when both credentials are present, the log otherwise.
pub fn build_notifier(token: Option<&str>, chat_id: Option<i64>) -> Result<Arc<dyn Notifier>> {
    match (token, chat_id) {
        (Some(token), Some(chat_id)) => Ok(Arc::new(TelegramNotifier::new(
            token,
            &chat_id.to_string(),
        )?)),
        _ => {
            warn!("Telegram not configured. Notifications go to the log.");
            Ok(Arc::new(LogNotifier))
        }
    }
}

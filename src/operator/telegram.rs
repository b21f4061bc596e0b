//! Telegram long-poll channel for the operator console.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::engine::wait_for_stop;

use super::console::OperatorConsole;

const TELEGRAM_API: &str = "https://api.telegram.org";

/// Seconds the server may hold a getUpdates request open.
const LONG_POLL_SECS: u64 = 25;

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<Update>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    chat: Chat,
    #[serde(default)]
    from: Option<User>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct User {
    id: i64,
}

/// Receives operator messages from one Telegram chat and answers them.
pub struct TelegramChannel {
    http: Client,
    base_url: String,
    token: String,
    chat_id: i64,
}

impl TelegramChannel {
    pub fn new(token: &str, chat_id: i64) -> Result<Self> {
        Self::with_base_url(TELEGRAM_API, token, chat_id)
    }

    /// Create with custom base URL (for testing).
    pub fn with_base_url(base_url: &str, token: &str, chat_id: i64) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(LONG_POLL_SECS + 10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            chat_id,
        })
    }

    /// Poll until `running` turns false. Messages sent while the process was
    /// down are dropped.
    pub async fn run(&self, console: Arc<OperatorConsole>, mut running: watch::Receiver<bool>) {
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_secs(1))
            .with_max_interval(Duration::from_secs(60))
            .with_max_elapsed_time(None)
            .build();

        let mut offset = loop {
            tokio::select! {
                res = self.skip_pending() => match res {
                    Ok(offset) => break offset,
                    Err(e) => {
                        let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(60));
                        warn!(error = %e, delay = ?delay, "Telegram unavailable, retrying");
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = wait_for_stop(&mut running) => return,
                        }
                    }
                },
                _ = wait_for_stop(&mut running) => return,
            }
        };
        backoff.reset();
        info!(chat_id = self.chat_id, "Operator channel listening");

        loop {
            tokio::select! {
                res = self.poll_once(&console, offset, LONG_POLL_SECS) => match res {
                    Ok(next) => {
                        offset = next;
                        backoff.reset();
                    }
                    Err(e) => {
                        let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(60));
                        warn!(error = %e, delay = ?delay, "Telegram polling failed");
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = wait_for_stop(&mut running) => break,
                        }
                    }
                },
                _ = wait_for_stop(&mut running) => break,
            }
        }

        info!("Operator channel stopped");
    }

    /// Offset just past the newest queued update.
    async fn skip_pending(&self) -> Result<i64> {
        let updates = self.get_updates(-1, 0).await?;
        Ok(updates.last().map(|u| u.update_id + 1).unwrap_or(0))
    }

    /// Fetch one batch, answer it, and return the next offset.
    async fn poll_once(
        &self,
        console: &OperatorConsole,
        offset: i64,
        timeout_secs: u64,
    ) -> Result<i64> {
        let updates = self.get_updates(offset, timeout_secs).await?;
        let mut next = offset;

        for update in updates {
            next = next.max(update.update_id + 1);
            let Some(message) = update.message else {
                continue;
            };
            if message.chat.id != self.chat_id {
                debug!(chat_id = message.chat.id, "Ignoring message from unknown chat");
                continue;
            }
            let Some(text) = message.text else {
                continue;
            };

            let user = message.from.map(|u| u.id).unwrap_or(message.chat.id);
            for reply in console.handle(user, &text).await {
                if let Err(e) = self.send_message(&reply).await {
                    warn!(error = %e, "Failed to send reply");
                }
            }
        }

        Ok(next)
    }

    async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Update>> {
        let url = format!("{}/bot{}/getUpdates", self.base_url, self.token);
        let resp: UpdatesResponse = self
            .http
            .post(&url)
            .json(&json!({
                "offset": offset,
                "timeout": timeout_secs,
                "allowed_updates": ["message"],
            }))
            .send()
            .await
            .context("getUpdates request failed")?
            .json()
            .await
            .context("Failed to parse getUpdates response")?;

        if !resp.ok {
            bail!(
                "getUpdates rejected: {}",
                resp.description.unwrap_or_default()
            );
        }
        Ok(resp.result)
    }

    async fn send_message(&self, text: &str) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.base_url, self.token);
        let resp = self
            .http
            .post(&url)
            .json(&json!({ "chat_id": self.chat_id, "text": text }))
            .send()
            .await
            .context("sendMessage request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("sendMessage failed: {} - {}", status, body);
        }
        Ok(())
    }
}

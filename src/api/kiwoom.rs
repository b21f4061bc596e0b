//! Kiwoom REST client for account queries and order execution.
//!
//! Every endpoint is a JSON `POST` whose operation is selected by the
//! `api-id` header. The client handles:
//! - OAuth client-credential token issuance and caching
//! - Orderable cash, holdings and best-ask queries
//! - Market and limit order placement on KRX

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::models::RawHolding;

use super::broker::{Broker, OrderAck, OrderRequest, OrderSide};
use super::types::*;

/// Production REST endpoint.
pub const KIWOOM_URL: &str = "https://api.kiwoom.com";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const PATH_TOKEN: &str = "/oauth2/token";
const PATH_STOCK_INFO: &str = "/api/dostk/stkinfo";
const PATH_ACCOUNT: &str = "/api/dostk/acnt";
const PATH_MARKET: &str = "/api/dostk/mrkcond";
const PATH_ORDER: &str = "/api/dostk/ordr";

/// Kiwoom REST client bound to one account.
pub struct KiwoomClient {
    http: Client,
    base_url: String,
    app_key: String,
    app_secret: String,
    account: String,
    token: Mutex<Option<String>>,
}

impl KiwoomClient {
    /// Create a new client.
    ///
    /// # Arguments
    /// * `base_url` - REST base URL (without trailing slash)
    /// * `app_key` - Application key
    /// * `app_secret` - Application secret
    /// * `account` - Account number orders are placed against
    pub fn new(base_url: &str, app_key: &str, app_secret: &str, account: &str) -> Result<Self> {
        if app_key.is_empty() || app_secret.is_empty() {
            bail!("Kiwoom app key and secret must be set");
        }
        if account.is_empty() {
            warn!("Kiwoom account number is empty; account queries may fail");
        }

        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            app_key: app_key.to_string(),
            app_secret: app_secret.to_string(),
            account: account.to_string(),
            token: Mutex::new(None),
        })
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Issue a fresh token, bypassing the cache.
    async fn issue_token(&self) -> Result<String> {
        let url = format!("{}{}", self.base_url, PATH_TOKEN);
        let body = TokenRequest {
            grant_type: "client_credentials",
            appkey: &self.app_key,
            secretkey: &self.app_secret,
        };

        let resp = self
            .http
            .post(&url)
            .header("content-type", "application/json;charset=UTF-8")
            .header("api-id", "au10001")
            .json(&body)
            .send()
            .await
            .context("Token request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Token request rejected: {} - {}", status, text));
        }

        let parsed: TokenResponse = resp.json().await.context("Failed to parse token response")?;
        match parsed.token.filter(|t| !t.is_empty()) {
            Some(token) => {
                info!(expires = ?parsed.expires_dt, "Kiwoom token issued");
                Ok(token)
            }
            None => Err(anyhow!(
                "Token response carried no token: {}",
                parsed.return_msg.unwrap_or_default()
            )),
        }
    }

    /// Call an endpoint and return its JSON body.
    ///
    /// A 401 drops the cached token so the next call re-authenticates. A
    /// non-zero `return_code` is an error even on HTTP 200.
    async fn call<B: Serialize + ?Sized>(&self, path: &str, api_id: &str, body: &B) -> Result<Value> {
        let token = self.token().await?;
        let url = format!("{}{}", self.base_url, path);

        debug!(api_id = %api_id, url = %url, "Kiwoom request");

        let resp = self
            .http
            .post(&url)
            .header("content-type", "application/json;charset=UTF-8")
            .header("api-id", api_id)
            .bearer_auth(&token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("{} request failed", api_id))?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            *self.token.lock().await = None;
            bail!("{} unauthorized; cached token discarded", api_id);
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("{} failed: {} - {}", api_id, status, text);
        }

        let data: Value = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response", api_id))?;

        let envelope = ReturnEnvelope::of(&data);
        if !envelope.is_success() {
            bail!("{} rejected: {}", api_id, envelope.message());
        }
        Ok(data)
    }
}

#[async_trait]
impl Broker for KiwoomClient {
    async fn token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }

        let token = self.issue_token().await.map_err(|e| {
            error!(error = %e, "Failed to get Kiwoom token");
            e
        })?;
        *cached = Some(token.clone());
        Ok(token)
    }

    async fn invalidate_token(&self) {
        if self.token.lock().await.take().is_some() {
            info!("Cached Kiwoom token discarded");
        }
    }

    async fn balance(&self) -> Result<Decimal> {
        let data = self
            .call(
                PATH_ACCOUNT,
                "kt00001",
                &json!({ "acc_no": self.account, "qry_tp": "3" }),
            )
            .await?;

        let value = first_present(&data, BALANCE_KEYS)
            .ok_or_else(|| anyhow!("Balance response has none of {:?}", BALANCE_KEYS))?;
        parse_signed_decimal(value).ok_or_else(|| anyhow!("Unparsable balance: {}", value))
    }

    async fn holdings(&self) -> Result<Vec<RawHolding>> {
        let data = self
            .call(
                PATH_ACCOUNT,
                "kt00004",
                &json!({ "acc_no": self.account, "qry_tp": "0", "dmst_stex_tp": "KRX" }),
            )
            .await?;

        let Some(list) = first_present(&data, HOLDINGS_KEYS) else {
            // An empty account omits the list entirely
            return Ok(Vec::new());
        };
        let entries = list
            .as_array()
            .ok_or_else(|| anyhow!("Holdings field is not a list"))?;

        // Entries that are not even objects become empty raw holdings and
        // are rejected one by one downstream.
        Ok(entries
            .iter()
            .map(|e| serde_json::from_value(e.clone()).unwrap_or_default())
            .collect())
    }

    async fn best_ask(&self, symbol: &str) -> Result<Option<Decimal>> {
        let data = self
            .call(PATH_MARKET, "ka10004", &json!({ "stk_cd": symbol }))
            .await?;

        // Prices come back signed to indicate direction vs. previous close
        Ok(first_present(&data, BEST_ASK_KEYS)
            .and_then(parse_signed_decimal)
            .map(|p| p.abs())
            .filter(|p| !p.is_zero()))
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck> {
        let api_id = match order.side {
            OrderSide::Buy => "kt10000",
            OrderSide::Sell => "kt10001",
        };
        let body = OrderBody {
            acc_no: self.account.clone(),
            dmst_stex_tp: "KRX".to_string(),
            stk_cd: order.symbol.clone(),
            ord_qty: order.quantity.to_string(),
            ord_uv: if order.is_market() {
                "0".to_string()
            } else {
                order.price.normalize().to_string()
            },
            // 0: limit, 3: market
            trde_tp: if order.is_market() { "3" } else { "0" }.to_string(),
            cond_uv: String::new(),
        };

        let data = self.call(PATH_ORDER, api_id, &body).await?;
        let envelope = ReturnEnvelope::of(&data);

        info!(
            side = %order.side,
            symbol = %order.symbol,
            quantity = order.quantity,
            order_no = ?envelope.ord_no,
            "Order placed"
        );
        Ok(OrderAck {
            order_no: envelope.ord_no,
        })
    }

    async fn display_name(&self, symbol: &str) -> Result<String> {
        let data = self
            .call(PATH_STOCK_INFO, "ka10001", &json!({ "stk_cd": symbol }))
            .await?;

        first_present(&data, NAME_KEYS)
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .ok_or_else(|| anyhow!("No name for {}", symbol))
    }
}

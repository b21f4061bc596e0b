//! In-memory broker, notifier and stream fakes for engine tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::json;

use crate::api::{Broker, OrderAck, OrderRequest, OrderSide};
use crate::models::{normalize_symbol, RawHolding};
use crate::notify::Notifier;
use crate::stream::{StreamConnection, StreamConnector};

#[derive(Default)]
struct FakeState {
    balance: Decimal,
    holdings: Vec<RawHolding>,
    asks: HashMap<String, Decimal>,
    names: HashMap<String, String>,
    orders: Vec<OrderRequest>,
    token: Option<String>,
    tokens_issued: usize,
    fail_token: bool,
    fail_orders: bool,
    fail_holdings: bool,
    fill_orders: bool,
}

/// Scriptable broker account.
#[derive(Default)]
pub struct FakeBroker {
    state: Mutex<FakeState>,
}

pub fn raw_holding(symbol: &str, quantity: u64, pct: Decimal) -> RawHolding {
    serde_json::from_value(json!({
        "stk_cd": format!("A{}", symbol),
        "stk_nm": format!("Stock {}", symbol),
        "rmnd_qty": format!("{:012}", quantity),
        "pl_rt": pct.to_string(),
    }))
    .unwrap()
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_balance(self, balance: Decimal) -> Self {
        self.state.lock().balance = balance;
        self
    }

    pub fn with_holding(self, symbol: &str, quantity: u64, pct: Decimal) -> Self {
        self.state.lock().holdings.push(raw_holding(symbol, quantity, pct));
        self
    }

    pub fn with_raw_holding(self, raw: RawHolding) -> Self {
        self.state.lock().holdings.push(raw);
        self
    }

    pub fn with_ask(self, symbol: &str, price: Decimal) -> Self {
        self.state.lock().asks.insert(symbol.to_string(), price);
        self
    }

    pub fn with_name(self, symbol: &str, name: &str) -> Self {
        self.state.lock().names.insert(symbol.to_string(), name.to_string());
        self
    }

    /// Every order is rejected.
    pub fn failing_orders(self) -> Self {
        self.state.lock().fail_orders = true;
        self
    }

    /// Holdings queries fail.
    pub fn failing_holdings(self) -> Self {
        self.state.lock().fail_holdings = true;
        self
    }

    /// Token issuance fails.
    pub fn failing_token(self) -> Self {
        self.state.lock().fail_token = true;
        self
    }

    /// Accepted orders change holdings immediately.
    pub fn filling_orders(self) -> Self {
        self.state.lock().fill_orders = true;
        self
    }

    pub fn set_failing_holdings(&self, fail: bool) {
        self.state.lock().fail_holdings = fail;
    }

    pub fn orders(&self) -> Vec<OrderRequest> {
        self.state.lock().orders.clone()
    }

    pub fn holding_count(&self) -> usize {
        self.state.lock().holdings.len()
    }
}

#[async_trait]
impl Broker for FakeBroker {
    async fn token(&self) -> Result<String> {
        let mut state = self.state.lock();
        if state.fail_token {
            bail!("invalid credentials");
        }
        if let Some(token) = &state.token {
            return Ok(token.clone());
        }
        state.tokens_issued += 1;
        let token = format!("fake-token-{}", state.tokens_issued);
        state.token = Some(token.clone());
        Ok(token)
    }

    async fn invalidate_token(&self) {
        self.state.lock().token = None;
    }

    async fn balance(&self) -> Result<Decimal> {
        Ok(self.state.lock().balance)
    }

    async fn holdings(&self) -> Result<Vec<RawHolding>> {
        let state = self.state.lock();
        if state.fail_holdings {
            bail!("holdings unavailable");
        }
        Ok(state.holdings.clone())
    }

    async fn best_ask(&self, symbol: &str) -> Result<Option<Decimal>> {
        Ok(self.state.lock().asks.get(symbol).copied())
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck> {
        // Let concurrent callers interleave like real network calls would
        tokio::task::yield_now().await;

        let mut state = self.state.lock();
        state.orders.push(order.clone());
        if state.fail_orders {
            return Err(anyhow!("order rejected"));
        }
        if state.fill_orders {
            match order.side {
                OrderSide::Buy => {
                    state
                        .holdings
                        .push(raw_holding(&order.symbol, order.quantity, Decimal::ZERO));
                }
                OrderSide::Sell => state
                    .holdings
                    .retain(|h| h.symbol().as_deref() != Some(normalize_symbol(&order.symbol))),
            }
        }
        Ok(OrderAck {
            order_no: Some(format!("{:07}", state.orders.len())),
        })
    }

    async fn display_name(&self, symbol: &str) -> Result<String> {
        self.state
            .lock()
            .names
            .get(symbol)
            .cloned()
            .ok_or_else(|| anyhow!("unknown symbol {}", symbol))
    }
}

/// Collects notifications.
#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, message: &str) {
        self.messages.lock().push(message.to_string());
    }
}

/// What one scripted connection does.
pub enum Script {
    /// The connect attempt itself fails
    Refuse,
    /// Deliver these frames, then stay open until stopped
    Frames(Vec<String>),
    /// Deliver these frames, then close
    FramesThenClose(Vec<String>),
}

/// Connector replaying one script per connect attempt. Once the scripts run
/// out, further connect attempts never complete.
#[derive(Default)]
pub struct ScriptedConnector {
    scripts: Mutex<VecDeque<Script>>,
    sent: Arc<Mutex<Vec<Vec<String>>>>,
}

impl ScriptedConnector {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            sent: Arc::default(),
        }
    }

    /// Frames sent on each established connection, in connect order.
    pub fn sent(&self) -> Vec<Vec<String>> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl StreamConnector for ScriptedConnector {
    async fn connect(&self) -> Result<Box<dyn StreamConnection>> {
        let script = self.scripts.lock().pop_front();
        let (frames, close) = match script {
            Some(Script::Refuse) => bail!("connection refused"),
            Some(Script::Frames(frames)) => (frames, false),
            Some(Script::FramesThenClose(frames)) => (frames, true),
            None => std::future::pending().await,
        };

        let index = {
            let mut sent = self.sent.lock();
            sent.push(Vec::new());
            sent.len() - 1
        };
        Ok(Box::new(ScriptedConnection {
            inbound: frames.into(),
            close,
            sent: self.sent.clone(),
            index,
        }))
    }
}

struct ScriptedConnection {
    inbound: VecDeque<String>,
    close: bool,
    sent: Arc<Mutex<Vec<Vec<String>>>>,
    index: usize,
}

#[async_trait]
impl StreamConnection for ScriptedConnection {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.sent.lock()[self.index].push(text);
        Ok(())
    }

    async fn next_text(&mut self) -> Option<Result<String>> {
        tokio::task::yield_now().await;
        match self.inbound.pop_front() {
            Some(frame) => Some(Ok(frame)),
            None if self.close => None,
            None => std::future::pending().await,
        }
    }
}

pub fn login_ok() -> String {
    json!({"trnm": "LOGIN", "return_code": 0, "return_msg": "ok"}).to_string()
}

pub fn login_rejected() -> String {
    json!({"trnm": "LOGIN", "return_code": 100013, "return_msg": "invalid token"}).to_string()
}

pub fn real(symbols: &[&str]) -> String {
    let data: Vec<_> = symbols
        .iter()
        .map(|s| json!({"type": "02", "values": {"9001": s}}))
        .collect();
    json!({"trnm": "REAL", "data": data}).to_string()
}

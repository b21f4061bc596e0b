//! Broker gateway abstraction used by the trading engine.

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::RawHolding;

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// A new cash-equity order. A zero price means a market order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRequest {
    pub symbol: String,
    pub quantity: u64,
    pub price: Decimal,
    pub side: OrderSide,
}

impl OrderRequest {
    pub fn market(symbol: impl Into<String>, quantity: u64, side: OrderSide) -> Self {
        Self {
            symbol: symbol.into(),
            quantity,
            price: Decimal::ZERO,
            side,
        }
    }

    pub fn limit(symbol: impl Into<String>, quantity: u64, price: Decimal, side: OrderSide) -> Self {
        Self {
            symbol: symbol.into(),
            quantity,
            price,
            side,
        }
    }

    pub fn is_market(&self) -> bool {
        self.price.is_zero()
    }
}

/// Broker acknowledgement of an accepted order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderAck {
    pub order_no: Option<String>,
}

/// Everything the engine needs from the brokerage account.
///
/// Implementations are bound to a single account. Every call goes to the
/// broker; nothing here is cached except the auth token.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Auth token, fetched once and reused.
    async fn token(&self) -> Result<String>;

    /// Drop the cached token so the next `token` call issues a new one.
    async fn invalidate_token(&self);

    /// Orderable cash.
    async fn balance(&self) -> Result<Decimal>;

    /// Open positions, one raw entry each.
    async fn holdings(&self) -> Result<Vec<RawHolding>>;

    /// Best ask, `None` when the book has no usable price.
    async fn best_ask(&self, symbol: &str) -> Result<Option<Decimal>>;

    /// Place an order. A rejection by the broker is an error.
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck>;

    /// Human-readable name of a symbol.
    async fn display_name(&self, symbol: &str) -> Result<String>;
}

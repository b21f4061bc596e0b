//! Buy decision procedure: turns one condition match into at most one order.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::api::{Broker, OrderRequest, OrderSide};
use crate::models::normalize_symbol;
use crate::notify::Notifier;

use super::config::{ConfigStore, OrderStyle};

/// Business-rule reasons a signal does not lead to an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    MaxPositions { held: usize, max: usize },
    AlreadyHeld,
    AllocationBelowMinimum { allocation: Decimal, minimum: Decimal },
    InvalidQuote,
    ZeroQuantity { allocation: Decimal, ask: Decimal },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::MaxPositions { held, max } => {
                write!(f, "max positions reached ({}/{})", held, max)
            }
            SkipReason::AlreadyHeld => write!(f, "already holding"),
            SkipReason::AllocationBelowMinimum { allocation, minimum } => {
                write!(f, "allocation {} below minimum {}", allocation, minimum)
            }
            SkipReason::InvalidQuote => write!(f, "no valid ask price"),
            SkipReason::ZeroQuantity { allocation, ask } => {
                write!(f, "allocation {} buys zero shares at {}", allocation, ask)
            }
        }
    }
}

/// Result of one buy attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuyOutcome {
    /// Order accepted by the broker
    Placed {
        symbol: String,
        quantity: u64,
        price: Decimal,
        style: OrderStyle,
    },
    /// Rejected by an eligibility rule
    Skipped(SkipReason),
    /// A broker query failed before an order was attempted
    Aborted { stage: &'static str, error: String },
    /// All checks passed but the order was rejected
    OrderFailed { symbol: String, error: String },
}

/// Executes the buy procedure against the broker.
pub struct Buyer {
    broker: Arc<dyn Broker>,
    config: ConfigStore,
    notifier: Arc<dyn Notifier>,
    throttle: Duration,
    admission: Option<Arc<Mutex<()>>>,
}

impl Buyer {
    pub fn new(
        broker: Arc<dyn Broker>,
        config: ConfigStore,
        notifier: Arc<dyn Notifier>,
        throttle: Duration,
    ) -> Self {
        Self {
            broker,
            config,
            notifier,
            throttle,
            admission: None,
        }
    }

    /// Serialize eligibility checks and order placement across concurrent
    /// attempts so the position limit and the one-position-per-symbol rule
    /// hold even when signals arrive together.
    pub fn with_admission_gate(mut self) -> Self {
        self.admission = Some(Arc::new(Mutex::new(())));
        self
    }

    /// Run the procedure for one signal. Never panics or propagates errors.
    pub async fn check_and_buy(&self, symbol: &str) -> BuyOutcome {
        let symbol = normalize_symbol(symbol).to_string();

        let outcome = {
            let _admitted = match &self.admission {
                Some(gate) => Some(gate.lock().await),
                None => None,
            };
            self.admit_and_order(&symbol).await
        };

        match &outcome {
            BuyOutcome::Placed {
                quantity, style, ..
            } => {
                tokio::time::sleep(self.throttle).await;
                let name = match self.broker.display_name(&symbol).await {
                    Ok(name) if !name.is_empty() => name,
                    Ok(_) => symbol.clone(),
                    Err(e) => {
                        warn!(symbol = %symbol, error = %e, "Display name lookup failed");
                        symbol.clone()
                    }
                };
                let msg = format!(
                    "[AUTO BUY] {}({}) {} shares, {} order placed",
                    name, symbol, quantity, style
                );
                info!("{}", msg);
                self.notifier.notify(&msg).await;
            }
            BuyOutcome::Skipped(reason) => {
                info!(symbol = %symbol, reason = %reason, "Skipping buy");
            }
            BuyOutcome::Aborted { stage, error } => {
                error!(symbol = %symbol, stage = %stage, error = %error, "Buy aborted");
            }
            BuyOutcome::OrderFailed { error, .. } => {
                error!(symbol = %symbol, error = %error, "Buy order failed");
                self.notifier
                    .notify(&format!("[BUY FAILED] {} order error: {}", symbol, error))
                    .await;
            }
        }

        outcome
    }

    async fn admit_and_order(&self, symbol: &str) -> BuyOutcome {
        let config = self.config.snapshot();

        // 1-2. Position limit and duplicate check
        let holdings = match self.broker.holdings().await {
            Ok(h) => h,
            Err(e) => return aborted("holdings", e),
        };
        if holdings.len() >= config.max_positions {
            return BuyOutcome::Skipped(SkipReason::MaxPositions {
                held: holdings.len(),
                max: config.max_positions,
            });
        }
        if holdings
            .iter()
            .any(|h| h.symbol().as_deref() == Some(symbol))
        {
            return BuyOutcome::Skipped(SkipReason::AlreadyHeld);
        }

        tokio::time::sleep(self.throttle).await;

        // 3-4. Allocation
        let balance = match self.broker.balance().await {
            Ok(b) => b,
            Err(e) => return aborted("balance", e),
        };
        let allocation = balance * (config.buy_ratio / Decimal::ONE_HUNDRED);
        if allocation < config.min_order_amount {
            return BuyOutcome::Skipped(SkipReason::AllocationBelowMinimum {
                allocation,
                minimum: config.min_order_amount,
            });
        }

        tokio::time::sleep(self.throttle).await;

        // 5-6. Quote and size
        let ask = match self.broker.best_ask(symbol).await {
            Ok(Some(p)) if p > Decimal::ZERO => p,
            Ok(_) => return BuyOutcome::Skipped(SkipReason::InvalidQuote),
            Err(e) => return aborted("quote", e),
        };
        let quantity = (allocation / ask).floor().to_u64().unwrap_or(0);
        if quantity == 0 {
            return BuyOutcome::Skipped(SkipReason::ZeroQuantity { allocation, ask });
        }

        info!(
            symbol = %symbol,
            quantity = quantity,
            ask = %ask,
            ratio = %config.buy_ratio,
            "Buying"
        );

        tokio::time::sleep(self.throttle).await;

        // 7. Order
        let order = match config.order_style {
            OrderStyle::Market => OrderRequest::market(symbol, quantity, OrderSide::Buy),
            OrderStyle::Limit => OrderRequest::limit(symbol, quantity, ask, OrderSide::Buy),
        };
        match self.broker.place_order(&order).await {
            Ok(_) => BuyOutcome::Placed {
                symbol: symbol.to_string(),
                quantity,
                price: order.price,
                style: config.order_style,
            },
            Err(e) => BuyOutcome::OrderFailed {
                symbol: symbol.to_string(),
                error: e.to_string(),
            },
        }
    }
}

fn aborted(stage: &'static str, error: anyhow::Error) -> BuyOutcome {
    BuyOutcome::Aborted {
        stage,
        error: format!("{:#}", error),
    }
}

//! Trading configuration and the shared, runtime-mutable configuration store.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// How new positions are entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStyle {
    /// Limit order at the current best ask
    Limit,
    /// Market order (price 0)
    Market,
}

impl fmt::Display for OrderStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStyle::Limit => write!(f, "limit"),
            OrderStyle::Market => write!(f, "market"),
        }
    }
}

impl FromStr for OrderStyle {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "limit" => Ok(OrderStyle::Limit),
            "market" => Ok(OrderStyle::Market),
            other => Err(ConfigError::UnknownOrderStyle(other.to_string())),
        }
    }
}

/// Global trading parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Percentage of available cash allocated to each new position
    pub buy_ratio: Decimal,

    /// Limit or market entry
    pub order_style: OrderStyle,

    /// Minimum order notional in KRW
    pub min_order_amount: Decimal,

    /// Maximum number of concurrently held symbols
    pub max_positions: usize,

    /// Take-profit threshold on unrealized P/L percentage
    pub take_profit_pct: Decimal,

    /// Stop-loss threshold on unrealized P/L percentage (negative)
    pub stop_loss_pct: Decimal,

    /// Registered condition-search identifier
    pub condition_seq: String,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            buy_ratio: dec!(5.0),            // 5% of cash per entry
            order_style: OrderStyle::Limit,
            min_order_amount: dec!(50000),   // 50,000 KRW
            max_positions: 10,
            take_profit_pct: dec!(5.0),      // +5%
            stop_loss_pct: dec!(-5.0),       // -5%
            condition_seq: "0".to_string(),
        }
    }
}

/// Effective exit thresholds for one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitThresholds {
    pub take_profit: Decimal,
    pub stop_loss: Decimal,
}

/// Which per-symbol threshold an override targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdField {
    TakeProfit,
    StopLoss,
}

impl fmt::Display for ThresholdField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThresholdField::TakeProfit => write!(f, "take-profit"),
            ThresholdField::StopLoss => write!(f, "stop-loss"),
        }
    }
}

/// A single edit to a global field.
#[derive(Debug, Clone, PartialEq)]
pub enum GlobalSetting {
    BuyRatio(Decimal),
    OrderStyle(OrderStyle),
    MinOrderAmount(Decimal),
    MaxPositions(usize),
    TakeProfit(Decimal),
    StopLoss(Decimal),
    ConditionSeq(String),
}

/// Rejected configuration edits.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("buy ratio must be within (0, 100], got {0}")]
    InvalidBuyRatio(Decimal),

    #[error("minimum order amount must be positive, got {0}")]
    InvalidMinOrderAmount(Decimal),

    #[error("max positions must be between 1 and 50, got {0}")]
    InvalidMaxPositions(usize),

    #[error("take-profit must be positive, got {0}")]
    InvalidTakeProfit(Decimal),

    #[error("stop-loss must be negative, got {0}")]
    InvalidStopLoss(Decimal),

    #[error("condition identifier must not be empty")]
    EmptyCondition,

    #[error("unknown order style: {0}")]
    UnknownOrderStyle(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
struct SymbolOverride {
    take_profit: Option<Decimal>,
    stop_loss: Option<Decimal>,
}

#[derive(Debug)]
struct StoreState {
    global: TradingConfig,
    overrides: HashMap<String, SymbolOverride>,
}

/// Shared handle to the process-wide trading configuration.
///
/// Cloning is cheap; every clone sees the same state. The lock is only held
/// for in-memory reads and writes, so callers must never hold anything
/// returned from here across an await on the broker.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    inner: Arc<Mutex<StoreState>>,
}

impl ConfigStore {
    pub fn new(global: TradingConfig) -> Self {
        info!(
            buy_ratio = %global.buy_ratio,
            order_style = %global.order_style,
            take_profit = %global.take_profit_pct,
            stop_loss = %global.stop_loss_pct,
            "Trading configuration initialized"
        );
        Self {
            inner: Arc::new(Mutex::new(StoreState {
                global,
                overrides: HashMap::new(),
            })),
        }
    }

    /// Copy of the current global parameters.
    pub fn snapshot(&self) -> TradingConfig {
        self.inner.lock().global.clone()
    }

    /// Override-or-global thresholds for a symbol.
    pub fn get_effective(&self, symbol: &str) -> ExitThresholds {
        let state = self.inner.lock();
        let mut thresholds = ExitThresholds {
            take_profit: state.global.take_profit_pct,
            stop_loss: state.global.stop_loss_pct,
        };
        if let Some(o) = state.overrides.get(symbol) {
            if let Some(tp) = o.take_profit {
                thresholds.take_profit = tp;
            }
            if let Some(sl) = o.stop_loss {
                thresholds.stop_loss = sl;
            }
        }
        thresholds
    }

    /// Whether a symbol carries any override.
    pub fn has_override(&self, symbol: &str) -> bool {
        self.inner.lock().overrides.contains_key(symbol)
    }

    pub fn set_override(
        &self,
        symbol: &str,
        field: ThresholdField,
        value: Decimal,
    ) -> Result<(), ConfigError> {
        validate_threshold(field, value)?;

        let mut state = self.inner.lock();
        let entry = state.overrides.entry(symbol.to_string()).or_default();
        match field {
            ThresholdField::TakeProfit => entry.take_profit = Some(value),
            ThresholdField::StopLoss => entry.stop_loss = Some(value),
        }
        drop(state);

        info!(symbol = %symbol, field = %field, value = %value, "Symbol override set");
        Ok(())
    }

    /// Remove every override for a symbol. Returns whether one existed.
    pub fn clear_override(&self, symbol: &str) -> bool {
        let removed = self.inner.lock().overrides.remove(symbol).is_some();
        if removed {
            info!(symbol = %symbol, "Symbol override cleared");
        }
        removed
    }

    pub fn set_global(&self, setting: GlobalSetting) -> Result<(), ConfigError> {
        match &setting {
            GlobalSetting::BuyRatio(v) if *v <= Decimal::ZERO || *v > dec!(100) => {
                return Err(ConfigError::InvalidBuyRatio(*v));
            }
            GlobalSetting::MinOrderAmount(v) if *v <= Decimal::ZERO => {
                return Err(ConfigError::InvalidMinOrderAmount(*v));
            }
            GlobalSetting::MaxPositions(n) if !(1..=50).contains(n) => {
                return Err(ConfigError::InvalidMaxPositions(*n));
            }
            GlobalSetting::TakeProfit(v) => validate_threshold(ThresholdField::TakeProfit, *v)?,
            GlobalSetting::StopLoss(v) => validate_threshold(ThresholdField::StopLoss, *v)?,
            GlobalSetting::ConditionSeq(s) if s.trim().is_empty() => {
                return Err(ConfigError::EmptyCondition);
            }
            _ => {}
        }

        let mut state = self.inner.lock();
        let global = &mut state.global;
        match setting.clone() {
            GlobalSetting::BuyRatio(v) => global.buy_ratio = v,
            GlobalSetting::OrderStyle(s) => global.order_style = s,
            GlobalSetting::MinOrderAmount(v) => global.min_order_amount = v,
            GlobalSetting::MaxPositions(n) => global.max_positions = n,
            GlobalSetting::TakeProfit(v) => global.take_profit_pct = v,
            GlobalSetting::StopLoss(v) => global.stop_loss_pct = v,
            GlobalSetting::ConditionSeq(s) => global.condition_seq = s.trim().to_string(),
        }
        drop(state);

        info!(setting = ?setting, "Global setting updated");
        Ok(())
    }

    /// Human-readable snapshot for the operator.
    pub fn summary(&self) -> String {
        let state = self.inner.lock();
        let g = &state.global;

        let mut out = String::from("Current settings\n\n");
        out.push_str(&format!("Buy ratio:      {}% ({})\n", g.buy_ratio, g.order_style));
        out.push_str(&format!("Min order:      {} KRW\n", g.min_order_amount));
        out.push_str(&format!("Max positions:  {}\n", g.max_positions));
        out.push_str(&format!("Take-profit:    +{}%\n", g.take_profit_pct));
        out.push_str(&format!("Stop-loss:      {}%\n", g.stop_loss_pct));
        out.push_str(&format!("Condition:      #{}\n", g.condition_seq));

        if !state.overrides.is_empty() {
            out.push_str("\nSymbol overrides:\n");
            let mut symbols: Vec<_> = state.overrides.iter().collect();
            symbols.sort_by(|a, b| a.0.cmp(b.0));
            for (symbol, o) in symbols {
                let tp = o
                    .take_profit
                    .map(|v| format!("+{}%", v))
                    .unwrap_or_else(|| "-".to_string());
                let sl = o
                    .stop_loss
                    .map(|v| format!("{}%", v))
                    .unwrap_or_else(|| "-".to_string());
                out.push_str(&format!("  {}  TP {}  SL {}\n", symbol, tp, sl));
            }
        }

        out
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new(TradingConfig::default())
    }
}

fn validate_threshold(field: ThresholdField, value: Decimal) -> Result<(), ConfigError> {
    match field {
        ThresholdField::TakeProfit if value <= Decimal::ZERO => {
            Err(ConfigError::InvalidTakeProfit(value))
        }
        ThresholdField::StopLoss if value >= Decimal::ZERO => {
            Err(ConfigError::InvalidStopLoss(value))
        }
        _ => Ok(()),
    }
}

//! Holding model: one open position as reported by the broker.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::api::parse_signed_decimal;

/// Strip the broker's market prefix (`A005930` -> `005930`).
pub fn normalize_symbol(code: &str) -> &str {
    let code = code.trim();
    code.strip_prefix('A').unwrap_or(code)
}

/// Why a holding entry could not be interpreted.
#[derive(Debug, Error, PartialEq)]
pub enum HoldingError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("field `{field}` is not a valid number: {value}")]
    InvalidNumber { field: &'static str, value: String },
}

/// Holding entry exactly as the account report delivers it.
///
/// Every field is optional and loosely typed so one bad entry can be rejected
/// on its own instead of failing the whole report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawHolding {
    #[serde(rename = "stk_cd", default)]
    pub code: Option<Value>,

    #[serde(rename = "stk_nm", default)]
    pub name: Option<Value>,

    #[serde(rename = "rmnd_qty", default)]
    pub quantity: Option<Value>,

    #[serde(rename = "pl_rt", default)]
    pub pl_rate: Option<Value>,
}

impl RawHolding {
    /// Normalized symbol, if the entry carries one.
    pub fn symbol(&self) -> Option<String> {
        self.code
            .as_ref()
            .and_then(value_as_string)
            .map(|s| normalize_symbol(&s).to_string())
            .filter(|s| !s.is_empty())
    }

    /// Interpret the entry.
    pub fn parse(&self) -> Result<Holding, HoldingError> {
        let symbol = self.symbol().ok_or(HoldingError::MissingField("stk_cd"))?;

        let name = self
            .name
            .as_ref()
            .and_then(value_as_string)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| symbol.clone());

        let quantity = number_field(self.quantity.as_ref(), "rmnd_qty")?;
        let quantity = quantity
            .trunc()
            .to_u64()
            .ok_or_else(|| HoldingError::InvalidNumber {
                field: "rmnd_qty",
                value: quantity.to_string(),
            })?;

        let unrealized_pct = number_field(self.pl_rate.as_ref(), "pl_rt")?;

        Ok(Holding {
            symbol,
            name,
            quantity,
            unrealized_pct,
        })
    }
}

/// An open position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    /// Normalized symbol code
    pub symbol: String,

    /// Display name
    pub name: String,

    /// Shares held
    pub quantity: u64,

    /// Unrealized P/L as a percentage (e.g. 6.0 = +6%)
    pub unrealized_pct: Decimal,
}

impl Holding {
    /// Signed percentage for display, e.g. `+6.0%`.
    pub fn pct_label(&self) -> String {
        if self.unrealized_pct >= Decimal::ZERO {
            format!("+{}%", self.unrealized_pct)
        } else {
            format!("{}%", self.unrealized_pct)
        }
    }
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn number_field(value: Option<&Value>, field: &'static str) -> Result<Decimal, HoldingError> {
    let value = value.ok_or(HoldingError::MissingField(field))?;
    parse_signed_decimal(value).ok_or_else(|| HoldingError::InvalidNumber {
        field,
        value: value.to_string(),
    })
}

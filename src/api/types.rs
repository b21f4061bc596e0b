//! Request/response types for the Kiwoom REST API and helpers for its
//! loosely-typed JSON.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Candidate keys for orderable cash, in priority order.
///
/// The account reports are not consistent about field naming across report
/// types, so each concept is looked up through a short ordered list and the
/// first present, non-empty key wins.
pub const BALANCE_KEYS: &[&str] = &["ord_alow_amt", "entr"];

/// Candidate keys for the holdings list in the account evaluation report.
pub const HOLDINGS_KEYS: &[&str] = &["stk_acnt_evlt_prst", "acnt_evlt_remn_indv_tot"];

/// Candidate keys for the best ask in the order book report.
pub const BEST_ASK_KEYS: &[&str] = &["sel_fpr_bid"];

/// Candidate keys for the display name in the symbol info report.
pub const NAME_KEYS: &[&str] = &["stk_nm"];

/// Return the first candidate key that is present and not empty.
pub fn first_present<'a>(data: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| match data.get(*key) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(v) => Some(v),
    })
}

/// Parse numbers the way the broker sends them: JSON numbers or strings with
/// an optional sign, zero padding and thousands separators
/// (`"-000123.45"`, `"+1,200"`).
pub fn parse_signed_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .ok()
            .or_else(|| n.as_f64().and_then(|f| Decimal::try_from(f).ok())),
        Value::String(s) => {
            let cleaned: String = s.trim().chars().filter(|c| *c != ',').collect();
            let (negative, digits) = match cleaned.strip_prefix('-') {
                Some(rest) => (true, rest),
                None => (false, cleaned.strip_prefix('+').unwrap_or(&cleaned)),
            };
            if digits.is_empty() {
                return None;
            }
            let parsed = Decimal::from_str(digits).ok()?;
            Some(if negative { -parsed } else { parsed })
        }
        _ => None,
    }
}

/// Token request body (`au10001`).
#[derive(Debug, Clone, Serialize)]
pub struct TokenRequest<'a> {
    pub grant_type: &'a str,
    pub appkey: &'a str,
    pub secretkey: &'a str,
}

/// Token response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub expires_dt: Option<String>,
    #[serde(default)]
    pub return_code: Option<Value>,
    #[serde(default)]
    pub return_msg: Option<String>,
}

/// Order request body (`kt10000` buy / `kt10001` sell).
#[derive(Debug, Clone, Serialize)]
pub struct OrderBody {
    pub acc_no: String,
    pub dmst_stex_tp: String,
    pub stk_cd: String,
    pub ord_qty: String,
    pub ord_uv: String,
    pub trde_tp: String,
    pub cond_uv: String,
}

/// Result envelope common to every endpoint.
#[derive(Debug, Clone, Default)]
pub struct ReturnEnvelope {
    pub return_code: Option<Value>,
    pub return_msg: Option<String>,
    pub ord_no: Option<String>,
}

impl ReturnEnvelope {
    /// Pick the envelope fields out of any response body.
    pub fn of(data: &Value) -> Self {
        let text = |key: &str| data.get(key).and_then(Value::as_str).map(str::to_string);
        Self {
            return_code: data.get("return_code").filter(|v| !v.is_null()).cloned(),
            return_msg: text("return_msg"),
            ord_no: text("ord_no"),
        }
    }

    /// `return_code` 0 (number or string) means success; an absent code is
    /// treated as success as well.
    pub fn is_success(&self) -> bool {
        match &self.return_code {
            None => true,
            Some(v) => parse_signed_decimal(v).map(|d| d.is_zero()).unwrap_or(false),
        }
    }

    pub fn message(&self) -> String {
        self.return_msg.clone().unwrap_or_else(|| "no message".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_first_present_priority() {
        let data = json!({"entr": "1000", "ord_alow_amt": "900"});
        assert_eq!(first_present(&data, BALANCE_KEYS), Some(&json!("900")));

        let data = json!({"entr": "1000", "ord_alow_amt": ""});
        assert_eq!(first_present(&data, BALANCE_KEYS), Some(&json!("1000")));

        let data = json!({"other": 1});
        assert_eq!(first_present(&data, BALANCE_KEYS), None);
    }

    #[test]
    fn test_parse_signed_decimal() {
        assert_eq!(parse_signed_decimal(&json!("000001234")), Some(dec!(1234)));
        assert_eq!(parse_signed_decimal(&json!("-00071500")), Some(dec!(-71500)));
        assert_eq!(parse_signed_decimal(&json!("+1,200.5")), Some(dec!(1200.5)));
        assert_eq!(parse_signed_decimal(&json!(6.25)), Some(dec!(6.25)));
        assert_eq!(parse_signed_decimal(&json!("")), None);
        assert_eq!(parse_signed_decimal(&json!("-")), None);
        assert_eq!(parse_signed_decimal(&json!(null)), None);
    }

    #[test]
    fn test_return_envelope() {
        assert!(ReturnEnvelope::of(&json!({"return_code": 0})).is_success());
        assert!(ReturnEnvelope::of(&json!({"return_code": "0"})).is_success());
        assert!(ReturnEnvelope::of(&json!({"entr": "1000"})).is_success());
        assert!(ReturnEnvelope::of(&json!([1, 2])).is_success());

        let err = ReturnEnvelope::of(&json!({"return_code": 20, "return_msg": "insufficient"}));
        assert!(!err.is_success());
        assert_eq!(err.message(), "insufficient");

        let order = ReturnEnvelope::of(&json!({"return_code": 0, "ord_no": "0000123"}));
        assert_eq!(order.ord_no.as_deref(), Some("0000123"));
    }
}

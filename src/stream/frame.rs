//! Condition-search websocket frames.

use serde::Serialize;
use serde_json::Value;

/// Field carrying the symbol code in a real-time match item.
const SYMBOL_FIELD: &str = "9001";

/// Frames sent to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "trnm", rename_all = "UPPERCASE")]
pub enum OutboundFrame {
    Login {
        token: String,
    },
    Cnsrreq {
        seq: String,
        search_type: &'static str,
        stex_tp: &'static str,
    },
}

impl OutboundFrame {
    pub fn login(token: impl Into<String>) -> Self {
        OutboundFrame::Login {
            token: token.into(),
        }
    }

    /// Real-time subscription to a registered condition on the KRX board.
    pub fn subscribe(seq: impl Into<String>) -> Self {
        OutboundFrame::Cnsrreq {
            seq: seq.into(),
            search_type: "1",
            stex_tp: "K",
        }
    }

    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Frames received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    LoginAck { ok: bool, message: String },
    /// Heartbeat; the raw text must be echoed back unchanged
    Ping(String),
    /// Zero or more symbols matching the condition
    Matches(Vec<String>),
    SubscriptionAck { ok: bool, message: String },
    Other,
}

impl InboundFrame {
    /// Classify a text frame. Unparseable input is `Other`.
    pub fn parse(text: &str) -> Self {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => return InboundFrame::Other,
        };

        match value.get("trnm").and_then(Value::as_str) {
            Some("LOGIN") => InboundFrame::LoginAck {
                ok: return_ok(&value),
                message: return_msg(&value),
            },
            Some("PING") => InboundFrame::Ping(text.to_string()),
            Some("REAL") => InboundFrame::Matches(match_symbols(&value)),
            Some("CNSRREQ") => InboundFrame::SubscriptionAck {
                ok: return_ok(&value),
                message: return_msg(&value),
            },
            _ => InboundFrame::Other,
        }
    }
}

fn return_ok(value: &Value) -> bool {
    match value.get("return_code") {
        Some(Value::Number(n)) => n.as_i64() == Some(0),
        Some(Value::String(s)) => s.trim() == "0",
        // Some acks omit the code on success
        None => true,
        _ => false,
    }
}

fn return_msg(value: &Value) -> String {
    value
        .get("return_msg")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn match_symbols(value: &Value) -> Vec<String> {
    value
        .get("data")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("values")?.get(SYMBOL_FIELD)?.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

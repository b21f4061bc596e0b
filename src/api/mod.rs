//! Kiwoom API clients for account queries and trade execution.

mod broker;
mod kiwoom;
mod types;

pub use broker::{Broker, OrderAck, OrderRequest, OrderSide};
pub use kiwoom::{KiwoomClient, KIWOOM_URL};
pub use types::parse_signed_decimal;

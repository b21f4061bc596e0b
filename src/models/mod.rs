//! Data models for broker-reported holdings.

mod holding;

pub use holding::{normalize_symbol, Holding, RawHolding};

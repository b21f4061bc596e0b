//! Trading logic: shared configuration, buy decisions, position monitoring.

mod buyer;
mod config;
mod monitor;

pub use buyer::Buyer;
pub use config::{ConfigStore, GlobalSetting, OrderStyle, ThresholdField, TradingConfig};
pub use monitor::PositionMonitor;

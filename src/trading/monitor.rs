//! Position monitor: the polling sell loop.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::api::{Broker, OrderRequest, OrderSide};
use crate::engine::wait_for_stop;
use crate::models::Holding;
use crate::notify::Notifier;

use super::config::{ConfigStore, ExitThresholds};

/// Why a position is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::TakeProfit => write!(f, "take-profit"),
            ExitReason::StopLoss => write!(f, "stop-loss"),
        }
    }
}

/// Exit decision for one unrealized P/L reading. Both comparisons are strict.
pub fn evaluate_exit(pct: Decimal, thresholds: ExitThresholds) -> Option<ExitReason> {
    if pct > thresholds.take_profit {
        Some(ExitReason::TakeProfit)
    } else if pct < thresholds.stop_loss {
        Some(ExitReason::StopLoss)
    } else {
        None
    }
}

/// What one polling cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub evaluated: usize,
    pub malformed: usize,
    pub sold: Vec<String>,
    pub failed: Vec<String>,
}

/// Polls open positions and closes the ones past their thresholds.
pub struct PositionMonitor {
    broker: Arc<dyn Broker>,
    config: ConfigStore,
    notifier: Arc<dyn Notifier>,
    poll_interval: Duration,
}

impl PositionMonitor {
    pub fn new(
        broker: Arc<dyn Broker>,
        config: ConfigStore,
        notifier: Arc<dyn Notifier>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            broker,
            config,
            notifier,
            poll_interval,
        }
    }

    /// Poll until `running` turns false. A cycle in progress always completes.
    pub async fn run(&self, mut running: watch::Receiver<bool>) {
        info!(interval = ?self.poll_interval, "Position monitor started");

        while *running.borrow() {
            match self.run_cycle().await {
                Ok(report) if !report.sold.is_empty() || !report.failed.is_empty() => {
                    info!(
                        evaluated = report.evaluated,
                        sold = report.sold.len(),
                        failed = report.failed.len(),
                        "Monitor cycle complete"
                    );
                }
                Ok(_) => {}
                Err(e) => debug!(error = %e, "Monitor cycle skipped"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = wait_for_stop(&mut running) => break,
            }
        }

        info!("Position monitor stopped");
    }

    /// One pass over the current holdings.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let raw = self
            .broker
            .holdings()
            .await
            .context("Failed to fetch holdings")?;

        let mut report = CycleReport::default();
        let mut exits: Vec<(Holding, ExitReason)> = Vec::new();

        for entry in &raw {
            let holding = match entry.parse() {
                Ok(h) => h,
                Err(e) => {
                    warn!(symbol = ?entry.symbol(), error = %e, "Skipping malformed holding");
                    report.malformed += 1;
                    continue;
                }
            };
            if holding.quantity == 0 {
                continue;
            }

            report.evaluated += 1;
            let thresholds = self.config.get_effective(&holding.symbol);
            if let Some(reason) = evaluate_exit(holding.unrealized_pct, thresholds) {
                exits.push((holding, reason));
            }
        }

        for (holding, reason) in exits {
            if self.exit(&holding, reason).await {
                report.sold.push(holding.symbol);
            } else {
                report.failed.push(holding.symbol);
            }
        }

        Ok(report)
    }

    async fn exit(&self, holding: &Holding, reason: ExitReason) -> bool {
        info!(
            symbol = %holding.symbol,
            quantity = holding.quantity,
            pct = %holding.unrealized_pct,
            reason = %reason,
            "Exit triggered"
        );

        let order = OrderRequest::market(&holding.symbol, holding.quantity, OrderSide::Sell);
        match self.broker.place_order(&order).await {
            Ok(_) => {
                self.config.clear_override(&holding.symbol);
                self.notifier
                    .notify(&format!(
                        "[AUTO SELL] {}({}) {} shares at {} ({})",
                        holding.name,
                        holding.symbol,
                        holding.quantity,
                        holding.pct_label(),
                        reason
                    ))
                    .await;
                true
            }
            Err(e) => {
                error!(symbol = %holding.symbol, error = %e, "Exit order failed");
                self.notifier
                    .notify(&format!(
                        "[SELL FAILED] {}({}) {}: {}",
                        holding.name, holding.symbol, reason, e
                    ))
                    .await;
                false
            }
        }
    }
}

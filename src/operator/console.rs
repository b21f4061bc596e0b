//! Operator commands and per-user menu sessions.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::api::{Broker, OrderRequest, OrderSide};
use crate::engine::{Engine, StartOutcome, StopOutcome};
use crate::models::Holding;
use crate::notify::Notifier;
use crate::trading::ConfigStore;

use super::menu::{self, MenuAction, MenuState, Step};

const HELP: &str = "Commands\n\n\
    /start - start auto trading\n\
    /stop - stop auto trading\n\
    /status - account status\n\
    /m - settings menu\n\
    /help - this help";

/// Turns operator messages into engine control, configuration edits and replies.
pub struct OperatorConsole {
    engine: Arc<Engine>,
    broker: Arc<dyn Broker>,
    config: ConfigStore,
    notifier: Arc<dyn Notifier>,
    sessions: Mutex<HashMap<i64, MenuState>>,
}

impl OperatorConsole {
    pub fn new(
        engine: Arc<Engine>,
        broker: Arc<dyn Broker>,
        config: ConfigStore,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            engine,
            broker,
            config,
            notifier,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Handle one message from `user`, returning the replies to send.
    pub async fn handle(&self, user: i64, text: &str) -> Vec<String> {
        let text = text.trim();
        match text.strip_prefix('/') {
            Some(command) => self.command(user, command).await,
            None => self.menu_input(user, text).await,
        }
    }

    async fn command(&self, user: i64, command: &str) -> Vec<String> {
        // "/start@bot_name args" -> "start"
        let name = command
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .split('@')
            .next()
            .unwrap_or_default();
        info!(user = user, command = %name, "Operator command");

        let reply = match name {
            "start" => match self.engine.start().await {
                StartOutcome::Started => {
                    "Auto trading started (condition stream + exit monitor).".to_string()
                }
                StartOutcome::AlreadyRunning => "Already running.".to_string(),
            },
            "stop" => match self.engine.stop().await {
                StopOutcome::Stopped => "Auto trading stopped.".to_string(),
                StopOutcome::AlreadyStopped => "Already stopped.".to_string(),
            },
            "status" => match status_report(self.broker.as_ref()).await {
                Ok(report) => {
                    let engine = if self.engine.is_running().await {
                        "running"
                    } else {
                        "stopped"
                    };
                    format!("Engine: {}\n\n{}", engine, report)
                }
                Err(e) => {
                    warn!(error = %e, "Status query failed");
                    format!("Query failed: {:#}", e)
                }
            },
            "m" => {
                self.sessions.lock().insert(user, MenuState::Main);
                menu::render_main()
            }
            _ => HELP.to_string(),
        };
        vec![reply]
    }

    async fn menu_input(&self, user: i64, text: &str) -> Vec<String> {
        let state = self
            .sessions
            .lock()
            .remove(&user)
            .unwrap_or(MenuState::Main);

        let Step {
            mut next,
            mut replies,
            action,
        } = menu::transition(state, text, &self.config);

        match action {
            Some(MenuAction::LoadHoldings) => {
                let step = menu::enter_holdings(self.load_holdings().await);
                next = step.next;
                replies.extend(step.replies);
            }
            Some(MenuAction::Sell(holding)) => {
                replies.push(self.sell_now(&holding).await);
                replies.push(menu::render_main());
            }
            None => {}
        }

        self.sessions.lock().insert(user, next);
        replies
    }

    async fn load_holdings(&self) -> Vec<Holding> {
        match self.broker.holdings().await {
            Ok(raw) => raw
                .iter()
                .filter_map(|entry| match entry.parse() {
                    Ok(h) => Some(h),
                    Err(e) => {
                        warn!(symbol = ?entry.symbol(), error = %e, "Skipping malformed holding");
                        None
                    }
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "Failed to load holdings for menu");
                Vec::new()
            }
        }
    }

    async fn sell_now(&self, holding: &Holding) -> String {
        let order = OrderRequest::market(&holding.symbol, holding.quantity, OrderSide::Sell);
        match self.broker.place_order(&order).await {
            Ok(_) => {
                info!(symbol = %holding.symbol, quantity = holding.quantity, "Manual sell placed");
                self.config.clear_override(&holding.symbol);
                self.notifier
                    .notify(&format!(
                        "[MANUAL SELL] {}({}) {} shares market sell",
                        holding.name, holding.symbol, holding.quantity
                    ))
                    .await;
                format!(
                    "{} {} shares market sell order placed.",
                    holding.name, holding.quantity
                )
            }
            Err(e) => {
                warn!(symbol = %holding.symbol, error = %e, "Manual sell failed");
                format!("Sell order failed: {:#}", e)
            }
        }
    }
}

/// Cash and holdings, formatted for the operator.
pub async fn status_report(broker: &dyn Broker) -> Result<String> {
    let balance = broker.balance().await.context("Failed to fetch balance")?;
    let holdings = broker.holdings().await.context("Failed to fetch holdings")?;

    let mut out = format!("Account status\nCash: {} KRW\n\nHoldings:\n", format_krw(balance));
    if holdings.is_empty() {
        out.push_str("none");
    }
    for entry in &holdings {
        match entry.parse() {
            Ok(h) => out.push_str(&format!(
                "- {}: {} shares ({})\n",
                h.name,
                h.quantity,
                h.pct_label()
            )),
            Err(e) => out.push_str(&format!(
                "- {}: unreadable ({})\n",
                entry.symbol().unwrap_or_else(|| "?".to_string()),
                e
            )),
        }
    }
    Ok(out)
}

/// Whole won with thousands separators.
fn format_krw(amount: Decimal) -> String {
    let whole = amount.trunc().abs().to_string();
    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, c) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    if amount.is_sign_negative() && !amount.trunc().is_zero() {
        grouped.insert(0, '-');
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::testing::{FakeBroker, RecordingNotifier, ScriptedConnector};
    use crate::trading::ThresholdField;
    use rust_decimal_macros::dec;

    fn console(broker: &Arc<FakeBroker>, notifier: &Arc<RecordingNotifier>) -> (OperatorConsole, ConfigStore) {
        let config = ConfigStore::default();
        let engine = Arc::new(Engine::new(
            EngineConfig::default(),
            broker.clone(),
            Arc::new(ScriptedConnector::new(vec![])),
            config.clone(),
            notifier.clone(),
        ));
        let console = OperatorConsole::new(engine, broker.clone(), config.clone(), notifier.clone());
        (console, config)
    }

    #[test]
    fn test_format_krw() {
        assert_eq!(format_krw(dec!(1000000)), "1,000,000");
        assert_eq!(format_krw(dec!(999)), "999");
        assert_eq!(format_krw(dec!(1234.56)), "1,234");
        assert_eq!(format_krw(dec!(-50000)), "-50,000");
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_commands() {
        let broker = Arc::new(FakeBroker::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let (console, _) = console(&broker, &notifier);

        assert_eq!(console.handle(1, "/start").await, vec!["Auto trading started (condition stream + exit monitor)."]);
        assert_eq!(console.handle(1, "/start@condbot").await, vec!["Already running."]);
        assert_eq!(console.handle(1, "/stop").await, vec!["Auto trading stopped."]);
        assert_eq!(console.handle(1, "/stop").await, vec!["Already stopped."]);
        assert!(console.handle(1, "/unknown").await[0].starts_with("Commands"));
    }

    #[tokio::test]
    async fn test_status_command() {
        let broker = Arc::new(
            FakeBroker::new()
                .with_balance(dec!(1000000))
                .with_holding("005930", 12, dec!(3.5)),
        );
        let notifier = Arc::new(RecordingNotifier::default());
        let (console, _) = console(&broker, &notifier);

        let reply = console.handle(1, "/status").await;
        assert!(reply[0].starts_with("Engine: stopped"));
        assert!(reply[0].contains("Cash: 1,000,000 KRW"));
        assert!(reply[0].contains("- Stock 005930: 12 shares (+3.5%)"));
    }

    #[tokio::test]
    async fn test_override_through_holdings_menu() {
        let broker = Arc::new(FakeBroker::new().with_holding("005930", 12, dec!(3.5)));
        let notifier = Arc::new(RecordingNotifier::default());
        let (console, config) = console(&broker, &notifier);

        console.handle(7, "/m").await;
        let reply = console.handle(7, "1").await;
        assert!(reply[0].contains("1. Stock 005930  +3.5%"));
        console.handle(7, "1").await;
        console.handle(7, "1").await;
        console.handle(7, "4").await;

        assert_eq!(config.get_effective("005930").take_profit, dec!(10));
        assert_eq!(config.snapshot().take_profit_pct, dec!(5.0));
    }

    #[tokio::test]
    async fn test_sessions_are_per_user() {
        let broker = Arc::new(FakeBroker::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let (console, config) = console(&broker, &notifier);

        console.handle(1, "/m").await;
        console.handle(1, "3").await;
        // Another operator navigating elsewhere leaves this session alone
        console.handle(2, "/m").await;
        console.handle(2, "2").await;

        console.handle(1, "5").await;
        console.handle(1, "4").await;
        assert_eq!(config.snapshot().max_positions, 4);
    }

    #[tokio::test]
    async fn test_sell_now() {
        let broker = Arc::new(FakeBroker::new().with_holding("005930", 12, dec!(-2.0)));
        let notifier = Arc::new(RecordingNotifier::default());
        let (console, config) = console(&broker, &notifier);
        config
            .set_override("005930", ThresholdField::StopLoss, dec!(-9))
            .unwrap();

        console.handle(1, "/m").await;
        console.handle(1, "1").await;
        console.handle(1, "1").await;
        console.handle(1, "3").await;
        let reply = console.handle(1, "1").await;

        assert_eq!(reply[0], "Stock 005930 12 shares market sell order placed.");
        assert_eq!(
            broker.orders(),
            vec![OrderRequest::market("005930", 12, OrderSide::Sell)]
        );
        assert_eq!(
            notifier.messages(),
            vec!["[MANUAL SELL] Stock 005930(005930) 12 shares market sell".to_string()]
        );
        assert!(!config.has_override("005930"));
    }

    #[tokio::test]
    async fn test_failed_manual_sell_keeps_override() {
        let broker = Arc::new(
            FakeBroker::new()
                .with_holding("005930", 12, dec!(-2.0))
                .failing_orders(),
        );
        let notifier = Arc::new(RecordingNotifier::default());
        let (console, config) = console(&broker, &notifier);
        config
            .set_override("005930", ThresholdField::StopLoss, dec!(-9))
            .unwrap();

        console.handle(1, "/m").await;
        console.handle(1, "1").await;
        console.handle(1, "1").await;
        console.handle(1, "3").await;
        let reply = console.handle(1, "1").await;

        assert!(reply[0].starts_with("Sell order failed"));
        assert!(config.has_override("005930"));
    }
}

//! Condition-Search Auto Trader
//!
//! Buys symbols as a broker-side screening condition matches them, sells
//! positions that cross their take-profit or stop-loss thresholds, and lets
//! an operator retune everything from a chat while it runs.

mod api;
mod engine;
mod models;
mod notify;
mod operator;
mod stream;
mod trading;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::api::{Broker, KiwoomClient, KIWOOM_URL};
use crate::engine::{Engine, EngineConfig};
use crate::notify::build_notifier;
use crate::operator::{status_report, OperatorConsole, TelegramChannel};
use crate::stream::{WsConnector, KIWOOM_WS_URL};
use crate::trading::{ConfigStore, GlobalSetting, OrderStyle, TradingConfig};

/// Condition-search auto-trading CLI.
#[derive(Parser)]
#[command(name = "condtrader")]
#[command(about = "Trade Kiwoom condition-search matches with automatic exits", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Kiwoom application key
    #[arg(long, env = "KIWOOM_APP_KEY", hide_env_values = true)]
    app_key: Option<String>,

    /// Kiwoom application secret
    #[arg(long, env = "KIWOOM_SECRET_KEY", hide_env_values = true)]
    secret_key: Option<String>,

    /// Account number orders are placed against
    #[arg(long, env = "KIWOOM_ACCOUNT", default_value = "")]
    account: String,

    /// Kiwoom REST base URL
    #[arg(long, env = "KIWOOM_BASE_URL", default_value = KIWOOM_URL)]
    base_url: String,

    /// Condition-search websocket URL
    #[arg(long, env = "KIWOOM_WS_URL", default_value = KIWOOM_WS_URL)]
    ws_url: String,

    /// Telegram bot token for notifications and the operator menu
    #[arg(long, env = "TELEGRAM_BOT_TOKEN", hide_env_values = true)]
    telegram_token: Option<String>,

    /// Telegram chat allowed to operate the bot
    #[arg(long, env = "TELEGRAM_CHAT_ID")]
    telegram_chat_id: Option<i64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the operator channel and the trading engine
    Run {
        /// Percentage of orderable cash per new position
        #[arg(long)]
        buy_ratio: Option<Decimal>,

        /// Maximum number of concurrently held symbols
        #[arg(long)]
        max_positions: Option<usize>,

        /// Condition-search identifier to subscribe to
        #[arg(long)]
        condition: Option<String>,

        /// Enter positions with market orders instead of limit orders at the ask
        #[arg(long)]
        market_orders: bool,

        /// Start with the engine stopped; use /start from the chat
        #[arg(long)]
        paused: bool,
    },

    /// Show the default trading configuration
    Config,

    /// Show cash balance and holdings
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match &cli.command {
        Commands::Run {
            buy_ratio,
            max_positions,
            condition,
            market_orders,
            paused,
        } => {
            let trading = ConfigStore::new(TradingConfig::default());
            if let Some(ratio) = buy_ratio {
                trading.set_global(GlobalSetting::BuyRatio(*ratio))?;
            }
            if let Some(max) = max_positions {
                trading.set_global(GlobalSetting::MaxPositions(*max))?;
            }
            if let Some(seq) = condition {
                trading.set_global(GlobalSetting::ConditionSeq(seq.clone()))?;
            }
            if *market_orders {
                trading.set_global(GlobalSetting::OrderStyle(OrderStyle::Market))?;
            }

            run(&cli, trading, *paused).await?;
        }

        Commands::Config => {
            let trading = ConfigStore::new(TradingConfig::default());
            let engine = EngineConfig::default();

            println!("\n=== Trading Configuration ===\n");
            println!("{}", trading.summary());

            println!("=== Engine ===\n");
            println!("  Buy Throttle:         {:?}", engine.buy_throttle);
            println!("  Poll Interval:        {:?}", engine.poll_interval);
            println!("  Reconnect Delay:      {:?}", engine.reconnect_delay);
            println!("  Serialized Admission: {}", engine.serialize_admission);
        }

        Commands::Status => {
            let broker = kiwoom_client(&cli)?;
            println!("\n{}", status_report(&broker).await?);
        }
    }

    Ok(())
}

async fn run(cli: &Cli, trading: ConfigStore, paused: bool) -> Result<()> {
    let client = kiwoom_client(cli)?;
    info!(account = %client.account(), "Kiwoom client ready");
    let broker: Arc<dyn Broker> = Arc::new(client);
    let notifier = build_notifier(cli.telegram_token.as_deref(), cli.telegram_chat_id)?;
    let connector = Arc::new(WsConnector::new(&cli.ws_url));

    let engine = Arc::new(Engine::new(
        EngineConfig::default(),
        broker.clone(),
        connector,
        trading.clone(),
        notifier.clone(),
    ));
    let console = Arc::new(OperatorConsole::new(
        engine.clone(),
        broker,
        trading.clone(),
        notifier.clone(),
    ));

    let (running_tx, running_rx) = watch::channel(true);
    let channel_task = match (&cli.telegram_token, cli.telegram_chat_id) {
        (Some(token), Some(chat_id)) => {
            let channel = TelegramChannel::new(token, chat_id)?;
            Some(tokio::spawn(async move {
                channel.run(console, running_rx).await
            }))
        }
        _ => {
            warn!("Operator channel disabled: TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID are required");
            None
        }
    };

    if !paused {
        engine.start().await;
    }

    println!("\n=== Condition Trader ===");
    println!("{}", trading.summary());
    println!(
        "Engine: {}",
        if paused { "PAUSED (send /start)" } else { "RUNNING" }
    );
    println!("\nPress Ctrl+C to stop.\n");

    notifier
        .notify("Condition trader started. Send /help for commands.")
        .await;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Shutdown signal received");

    let _ = running_tx.send(false);
    engine.stop().await;
    if let Some(task) = channel_task {
        if let Err(e) = task.await {
            warn!(error = %e, "Operator channel task failed");
        }
    }

    notifier.notify("Condition trader stopped.").await;
    Ok(())
}

fn kiwoom_client(cli: &Cli) -> Result<KiwoomClient> {
    let app_key = cli.app_key.as_deref().context("KIWOOM_APP_KEY not set")?;
    let secret_key = cli
        .secret_key
        .as_deref()
        .context("KIWOOM_SECRET_KEY not set")?;
    KiwoomClient::new(&cli.base_url, app_key, secret_key, &cli.account)
}

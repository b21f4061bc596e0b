//! Engine runner: owns the run state and the background tasks.
//!
//! Handles:
//! - Streaming condition matches and dispatching one buy attempt per match
//! - Polling positions and closing the ones past their thresholds
//! - Idempotent start/stop driven by the operator

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, Instrument};

use crate::api::Broker;
use crate::notify::Notifier;
use crate::stream::{Signal, SignalSource, StreamConnector};
use crate::trading::{Buyer, ConfigStore, PositionMonitor};

/// Engine timings and concurrency policy.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Pause between broker calls within one buy attempt
    pub buy_throttle: Duration,

    /// Position monitor polling interval
    pub poll_interval: Duration,

    /// Delay before reconnecting the condition stream
    pub reconnect_delay: Duration,

    /// Run buy eligibility checks and order placement one signal at a time
    pub serialize_admission: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buy_throttle: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(5),
            serialize_admission: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    AlreadyStopped,
}

struct RunHandle {
    running: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

/// Trading engine: condition stream, buy dispatcher and position monitor.
pub struct Engine {
    config: EngineConfig,
    broker: Arc<dyn Broker>,
    connector: Arc<dyn StreamConnector>,
    trading: ConfigStore,
    notifier: Arc<dyn Notifier>,
    buyer: Arc<Buyer>,
    run: Mutex<Option<RunHandle>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        broker: Arc<dyn Broker>,
        connector: Arc<dyn StreamConnector>,
        trading: ConfigStore,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let mut buyer = Buyer::new(
            broker.clone(),
            trading.clone(),
            notifier.clone(),
            config.buy_throttle,
        );
        if config.serialize_admission {
            buyer = buyer.with_admission_gate();
        }

        Self {
            config,
            broker,
            connector,
            trading,
            notifier,
            buyer: Arc::new(buyer),
            run: Mutex::new(None),
        }
    }

    /// Spawn the background tasks unless they are already running.
    pub async fn start(&self) -> StartOutcome {
        let mut run = self.run.lock().await;
        if run.is_some() {
            return StartOutcome::AlreadyRunning;
        }

        let (running_tx, running_rx) = watch::channel(true);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();

        let source = SignalSource::new(
            self.connector.clone(),
            self.broker.clone(),
            self.trading.clone(),
            self.config.reconnect_delay,
        );
        let stop = running_rx.clone();
        tasks.spawn(async move { source.run(signal_tx, stop).await });

        let buyer = self.buyer.clone();
        let stop = running_rx.clone();
        tasks.spawn(dispatch(buyer, signal_rx, stop));

        let monitor = PositionMonitor::new(
            self.broker.clone(),
            self.trading.clone(),
            self.notifier.clone(),
            self.config.poll_interval,
        );
        tasks.spawn(async move { monitor.run(running_rx).await });

        *run = Some(RunHandle {
            running: running_tx,
            tasks,
        });

        info!(
            poll_interval = ?self.config.poll_interval,
            serialize_admission = self.config.serialize_admission,
            "Engine started"
        );
        StartOutcome::Started
    }

    /// Signal stop and wait for in-flight work to finish.
    ///
    /// Orders already being placed are never cancelled.
    pub async fn stop(&self) -> StopOutcome {
        let mut run = self.run.lock().await;
        let Some(mut handle) = run.take() else {
            return StopOutcome::AlreadyStopped;
        };

        info!("Stopping engine...");
        // Receivers may already be gone if every task ended on its own
        let _ = handle.running.send(false);

        while let Some(res) = handle.tasks.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "Engine task panicked");
            }
        }

        info!("Engine stopped");
        StopOutcome::Stopped
    }

    pub async fn is_running(&self) -> bool {
        self.run.lock().await.is_some()
    }
}

/// Spawn one buy attempt per signal, in arrival order, without blocking the stream.
async fn dispatch(
    buyer: Arc<Buyer>,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    mut running: watch::Receiver<bool>,
) {
    let mut buys = JoinSet::new();

    loop {
        tokio::select! {
            Some(signal) = signals.recv() => {
                debug!(symbol = %signal.symbol, received_at = %signal.received_at, "Dispatching signal");
                let buyer = buyer.clone();
                let span = info_span!("buy", signal_id = %signal.id, symbol = %signal.symbol);
                buys.spawn(
                    async move {
                        buyer.check_and_buy(&signal.symbol).await;
                    }
                    .instrument(span),
                );
            }
            Some(res) = buys.join_next(), if !buys.is_empty() => {
                if let Err(e) = res {
                    error!(error = %e, "Buy task panicked");
                }
            }
            _ = wait_for_stop(&mut running) => break,
            else => break,
        }
    }

    // In-flight buys run to completion
    while let Some(res) = buys.join_next().await {
        if let Err(e) = res {
            error!(error = %e, "Buy task panicked");
        }
    }
}

/// Resolve once the run flag is false or its sender is gone.
pub(crate) async fn wait_for_stop(running: &mut watch::Receiver<bool>) {
    loop {
        if !*running.borrow_and_update() {
            return;
        }
        if running.changed().await.is_err() {
            return;
        }
    }
}

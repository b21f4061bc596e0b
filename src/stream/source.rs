//! Reconnecting condition-match signal source.
//!
//! Each session walks a small state machine:
//!
//! ```text
//! connect -> LOGIN sent -> AwaitingLoginAck --ok--> CNSRREQ sent -> Streaming
//!                                 |                                   |
//!                              rejected                        PING: echo
//!                                 |                            REAL: dispatch
//!                                 v                                   |
//!                          Disconnected <---- drop / error / close ---+
//! ```
//!
//! A session that ends for any reason is followed by a fixed delay and a new
//! session, until the engine stops.

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::{Backoff, Constant};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::Broker;
use crate::engine::wait_for_stop;
use crate::trading::ConfigStore;

use super::frame::{InboundFrame, OutboundFrame};
use super::transport::{StreamConnection, StreamConnector};

/// One condition match, consumed at most once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub id: Uuid,
    pub symbol: String,
    pub received_at: DateTime<Utc>,
}

impl Signal {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.into(),
            received_at: Utc::now(),
        }
    }
}

/// Why a stream session ended.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connect failed: {0:#}")]
    Connect(anyhow::Error),

    #[error("auth token unavailable: {0:#}")]
    Token(anyhow::Error),

    #[error("login rejected: {0}")]
    LoginRejected(String),

    #[error("condition subscription rejected: {0}")]
    SubscriptionRejected(String),

    #[error("transport error: {0:#}")]
    Transport(anyhow::Error),

    #[error("connection closed by peer")]
    Closed,

    #[error("signal consumer is gone")]
    ConsumerGone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    AwaitingLoginAck,
    Streaming,
}

/// Emits a [`Signal`] for every symbol the registered condition matches.
pub struct SignalSource {
    connector: Arc<dyn StreamConnector>,
    broker: Arc<dyn Broker>,
    config: ConfigStore,
    reconnect_delay: Duration,
}

impl SignalSource {
    pub fn new(
        connector: Arc<dyn StreamConnector>,
        broker: Arc<dyn Broker>,
        config: ConfigStore,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            connector,
            broker,
            config,
            reconnect_delay,
        }
    }

    /// Run sessions until `running` turns false or the consumer goes away.
    ///
    /// A pending connect or read is abandoned as soon as stop is signalled.
    pub async fn run(
        &self,
        signals: mpsc::UnboundedSender<Signal>,
        mut running: watch::Receiver<bool>,
    ) {
        let mut backoff = Constant::new(self.reconnect_delay);

        while *running.borrow() {
            let ended = tokio::select! {
                err = self.session(&signals) => err,
                _ = wait_for_stop(&mut running) => break,
            };

            match &ended {
                SessionError::ConsumerGone => {
                    debug!("Signal consumer dropped, stopping condition stream");
                    break;
                }
                // Next login uses a freshly issued token
                SessionError::LoginRejected(_) => self.broker.invalidate_token().await,
                _ => {}
            }

            let delay = backoff.next_backoff().unwrap_or(self.reconnect_delay);
            warn!(error = %ended, delay = ?delay, "Condition stream session ended, reconnecting");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_stop(&mut running) => break,
            }
        }

        info!("Condition stream stopped");
    }

    /// One connection from connect to drop. Only returns when the session is over.
    async fn session(&self, signals: &mpsc::UnboundedSender<Signal>) -> SessionError {
        let mut conn = match self.connector.connect().await {
            Ok(c) => c,
            Err(e) => return SessionError::Connect(e),
        };

        let token = match self.broker.token().await {
            Ok(t) => t,
            Err(e) => return SessionError::Token(e),
        };
        if let Err(e) = send(&mut conn, OutboundFrame::login(token)).await {
            return e;
        }

        let mut state = SessionState::AwaitingLoginAck;

        loop {
            let text = match conn.next_text().await {
                Some(Ok(text)) => text,
                Some(Err(e)) => return SessionError::Transport(e),
                None => return SessionError::Closed,
            };

            match (state, InboundFrame::parse(&text)) {
                (_, InboundFrame::Ping(raw)) => {
                    if let Err(e) = conn.send_text(raw).await {
                        return SessionError::Transport(e);
                    }
                }
                (SessionState::AwaitingLoginAck, InboundFrame::LoginAck { ok: true, .. }) => {
                    // Read on every connect so an operator change applies to the next session
                    let seq = self.config.snapshot().condition_seq;
                    info!(condition = %seq, "Stream login accepted, subscribing");
                    if let Err(e) = send(&mut conn, OutboundFrame::subscribe(seq)).await {
                        return e;
                    }
                    state = SessionState::Streaming;
                }
                (SessionState::AwaitingLoginAck, InboundFrame::LoginAck { ok: false, message }) => {
                    return SessionError::LoginRejected(message);
                }
                (SessionState::Streaming, InboundFrame::SubscriptionAck { ok, message }) => {
                    if !ok {
                        return SessionError::SubscriptionRejected(message);
                    }
                    debug!("Condition subscription confirmed");
                }
                (SessionState::Streaming, InboundFrame::Matches(symbols)) => {
                    for symbol in symbols {
                        info!(symbol = %symbol, "Condition match");
                        if signals.send(Signal::new(symbol)).is_err() {
                            return SessionError::ConsumerGone;
                        }
                    }
                }
                (state, frame) => {
                    debug!(state = ?state, frame = ?frame, "Ignoring frame");
                }
            }
        }
    }
}

async fn send(
    conn: &mut Box<dyn StreamConnection>,
    frame: OutboundFrame,
) -> Result<(), SessionError> {
    let text = frame
        .to_text()
        .map_err(|e| SessionError::Transport(e.into()))?;
    conn.send_text(text).await.map_err(SessionError::Transport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{login_ok, login_rejected, real, FakeBroker, Script, ScriptedConnector};
    use crate::trading::GlobalSetting;
    use serde_json::{json, Value};
    use tokio::time::Instant;

    fn source(connector: &Arc<ScriptedConnector>, broker: FakeBroker, config: &ConfigStore) -> SignalSource {
        SignalSource::new(
            connector.clone(),
            Arc::new(broker),
            config.clone(),
            Duration::from_secs(5),
        )
    }

    fn trnm(frame: &str) -> String {
        let value: Value = serde_json::from_str(frame).unwrap();
        value["trnm"].as_str().unwrap_or_default().to_string()
    }

    fn kinds(sent: &[Vec<String>]) -> Vec<Vec<String>> {
        sent.iter()
            .map(|conn| conn.iter().map(|f| trnm(f)).collect())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resends_login_and_subscription_once() {
        let connector = Arc::new(ScriptedConnector::new(vec![
            Script::FramesThenClose(vec![login_ok(), real(&["A005930"])]),
            Script::Frames(vec![login_ok(), real(&["000660"])]),
        ]));
        let config = ConfigStore::default();
        let source = Arc::new(source(&connector, FakeBroker::new(), &config));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(true);

        let started = Instant::now();
        let task = tokio::spawn({
            let source = source.clone();
            async move { source.run(tx, stop_rx).await }
        });

        assert_eq!(rx.recv().await.unwrap().symbol, "A005930");
        assert_eq!(rx.recv().await.unwrap().symbol, "000660");
        assert!(started.elapsed() >= Duration::from_secs(5));

        stop_tx.send(false).unwrap();
        task.await.unwrap();

        assert_eq!(
            kinds(&connector.sent()),
            vec![vec!["LOGIN", "CNSRREQ"], vec!["LOGIN", "CNSRREQ"]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_rejection_backs_off_without_subscribing() {
        let connector = Arc::new(ScriptedConnector::new(vec![
            Script::Frames(vec![login_rejected(), real(&["999999"])]),
            Script::Refuse,
            Script::Frames(vec![login_ok(), real(&["005930"])]),
        ]));
        let config = ConfigStore::default();
        let source = Arc::new(source(&connector, FakeBroker::new(), &config));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(true);

        let started = Instant::now();
        let task = tokio::spawn({
            let source = source.clone();
            async move { source.run(tx, stop_rx).await }
        });

        // The match on the rejected session is never dispatched
        assert_eq!(rx.recv().await.unwrap().symbol, "005930");
        assert!(started.elapsed() >= Duration::from_secs(10));

        stop_tx.send(false).unwrap();
        task.await.unwrap();

        assert_eq!(
            kinds(&connector.sent()),
            vec![vec!["LOGIN"], vec!["LOGIN", "CNSRREQ"]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_rejection_reissues_token() {
        let connector = Arc::new(ScriptedConnector::new(vec![
            Script::Frames(vec![login_rejected()]),
            Script::Frames(vec![login_ok(), real(&["005930"])]),
        ]));
        let config = ConfigStore::default();
        let source = Arc::new(source(&connector, FakeBroker::new(), &config));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(true);

        let task = tokio::spawn({
            let source = source.clone();
            async move { source.run(tx, stop_rx).await }
        });
        rx.recv().await.unwrap();
        stop_tx.send(false).unwrap();
        task.await.unwrap();

        let tokens: Vec<String> = connector
            .sent()
            .iter()
            .map(|conn| {
                let login: Value = serde_json::from_str(&conn[0]).unwrap();
                login["token"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(tokens, vec!["fake-token-1", "fake-token-2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_is_echoed_verbatim() {
        let ping = json!({"trnm": "PING", "seq": "42"}).to_string();
        let connector = Arc::new(ScriptedConnector::new(vec![Script::Frames(vec![
            login_ok(),
            ping.clone(),
            real(&["005930", "000660"]),
        ])]));
        let config = ConfigStore::default();
        let source = Arc::new(source(&connector, FakeBroker::new(), &config));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(true);

        let task = tokio::spawn({
            let source = source.clone();
            async move { source.run(tx, stop_rx).await }
        });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!((first.symbol.as_str(), second.symbol.as_str()), ("005930", "000660"));
        assert_ne!(first.id, second.id);

        stop_tx.send(false).unwrap();
        task.await.unwrap();

        let sent = connector.sent();
        assert_eq!(sent[0].len(), 3);
        assert_eq!(sent[0][2], ping);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribes_to_configured_condition() {
        let connector = Arc::new(ScriptedConnector::new(vec![Script::Frames(vec![
            login_ok(),
            real(&["005930"]),
        ])]));
        let config = ConfigStore::default();
        config
            .set_global(GlobalSetting::ConditionSeq("7".to_string()))
            .unwrap();
        let source = Arc::new(source(&connector, FakeBroker::new(), &config));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(true);

        let task = tokio::spawn({
            let source = source.clone();
            async move { source.run(tx, stop_rx).await }
        });
        rx.recv().await.unwrap();
        stop_tx.send(false).unwrap();
        task.await.unwrap();

        let subscribe: Value = serde_json::from_str(&connector.sent()[0][1]).unwrap();
        assert_eq!(subscribe["seq"], "7");
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_failure_sends_nothing_and_stop_interrupts_backoff() {
        let connector = Arc::new(ScriptedConnector::new(vec![Script::Frames(vec![login_ok()])]));
        let config = ConfigStore::default();
        let source = Arc::new(source(&connector, FakeBroker::new().failing_token(), &config));
        let (tx, _rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(true);

        let task = tokio::spawn({
            let source = source.clone();
            async move { source.run(tx, stop_rx).await }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        stop_tx.send(false).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("source should stop during backoff")
            .unwrap();

        assert_eq!(connector.sent(), vec![Vec::<String>::new()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_pending_connect() {
        let connector = Arc::new(ScriptedConnector::new(vec![]));
        let config = ConfigStore::default();
        let source = Arc::new(source(&connector, FakeBroker::new(), &config));
        let (tx, _rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(true);

        let task = tokio::spawn({
            let source = source.clone();
            async move { source.run(tx, stop_rx).await }
        });
        tokio::task::yield_now().await;
        stop_tx.send(false).unwrap();
        task.await.unwrap();

        assert!(connector.sent().is_empty());
    }
}

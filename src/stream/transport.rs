//! Text-frame transport for the condition stream.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

/// Default condition-search websocket endpoint.
pub const KIWOOM_WS_URL: &str = "wss://api.kiwoom.com:10000/api/dostk/websocket";

/// Opens new stream connections.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn StreamConnection>>;
}

/// One open connection exchanging text frames.
#[async_trait]
pub trait StreamConnection: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Next text frame. `None` once the peer has closed.
    async fn next_text(&mut self) -> Option<Result<String>>;
}

/// Websocket connector.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl StreamConnector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn StreamConnection>> {
        let (ws, _response) = connect_async(self.url.as_str())
            .await
            .with_context(|| format!("Failed to connect to {}", self.url))?;
        info!(url = %self.url, "Condition stream connected");

        let (write, read) = ws.split();
        Ok(Box::new(WsConnection { write, read }))
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct WsConnection {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
}

#[async_trait]
impl StreamConnection for WsConnection {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.write
            .send(Message::Text(text))
            .await
            .context("Failed to send frame")
    }

    async fn next_text(&mut self) -> Option<Result<String>> {
        loop {
            match self.read.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(data)) => {
                    if let Ok(text) = String::from_utf8(data) {
                        return Some(Ok(text));
                    }
                }
                Ok(Message::Ping(data)) => {
                    debug!("Received ping, sending pong");
                    if let Err(e) = self.write.send(Message::Pong(data)).await {
                        return Some(Err(anyhow::Error::new(e).context("Failed to send pong")));
                    }
                }
                Ok(Message::Close(frame)) => {
                    info!(frame = ?frame, "Received close frame");
                    return None;
                }
                Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
                Err(e) => return Some(Err(anyhow::Error::new(e).context("Websocket read failed"))),
            }
        }
    }
}

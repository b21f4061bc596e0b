//! Real-time condition-search stream.

mod frame;
mod source;
mod transport;

pub use source::{Signal, SignalSource};
pub use transport::{StreamConnection, StreamConnector, WsConnector, KIWOOM_WS_URL};

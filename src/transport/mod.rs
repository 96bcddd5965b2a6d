//! Message transport seam. The session manager only sees these traits; the
//! concrete transport is picked when the client is built.

pub mod mock;
pub mod ws;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use mock::{MockServer, MockTransport};
pub use ws::WebSocketTransport;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("Connection refused: {0}")]
    Refused(String),
    #[error("Connection closed")]
    Closed,
}

/// Parameters handed to [`Transport::connect`]
#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    /// Keep-alive ping period; `None` disables pings
    pub ping_interval: Option<Duration>,
    pub connect_timeout: Duration,
}

/// Write half of an open connection
#[async_trait]
pub trait FrameSender: Send {
    async fn send(&mut self, frame: String) -> Result<(), TransportError>;
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of an open connection
#[async_trait]
pub trait FrameReceiver: Send {
    /// Next text frame; `None` once the peer has closed the connection.
    async fn next_frame(&mut self) -> Option<Result<String, TransportError>>;
}

/// An open, ready connection
pub struct Connection {
    pub sender: Box<dyn FrameSender>,
    pub receiver: Box<dyn FrameReceiver>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection and wait until it is ready to carry frames.
    async fn connect(
        &self,
        endpoint: &str,
        options: &ConnectOptions,
    ) -> Result<Connection, TransportError>;
}

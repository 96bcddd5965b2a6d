use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use url::Url;

use super::{
    ConnectOptions, Connection, FrameReceiver, FrameSender, Transport, TransportError,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = Arc<Mutex<SplitSink<WsStream, Message>>>;

/// WebSocket transport built on tokio-tungstenite
#[derive(Debug, Default, Clone)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(
        &self,
        endpoint: &str,
        options: &ConnectOptions,
    ) -> Result<Connection, TransportError> {
        let url = Url::parse(endpoint)?;
        log::info!(
            "🌐 Connecting to agent WebSocket at {}://{}{}",
            url.scheme(),
            url.host_str().unwrap_or_default(),
            url.path()
        );

        let (ws_stream, response) =
            tokio::time::timeout(options.connect_timeout, connect_async(url.as_str()))
                .await
                .map_err(|_| {
                    TransportError::Refused(format!(
                        "timed out after {:?}",
                        options.connect_timeout
                    ))
                })??;
        log::info!("✅ WebSocket connected, status: {}", response.status());

        let (write, read) = ws_stream.split();
        let sink: WsSink = Arc::new(Mutex::new(write));

        let keepalive = options
            .ping_interval
            .filter(|interval| !interval.is_zero())
            .map(|interval| spawn_keepalive(sink.clone(), interval));

        Ok(Connection {
            sender: Box::new(WsFrameSender { sink, keepalive }),
            receiver: Box::new(WsFrameReceiver { read }),
        })
    }
}

fn spawn_keepalive(sink: WsSink, interval: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // first tick fires immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let mut sink = sink.lock().await;
            if let Err(e) = sink.send(Message::Ping(Vec::new().into())).await {
                log::debug!("Keep-alive ping failed, stopping: {}", e);
                break;
            }
            log::trace!("Keep-alive ping sent");
        }
    })
}

struct WsFrameSender {
    sink: WsSink,
    keepalive: Option<JoinHandle<()>>,
}

#[async_trait]
impl FrameSender for WsFrameSender {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(frame.into())).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.abort();
        }
        let mut sink = self.sink.lock().await;
        sink.close().await?;
        Ok(())
    }
}

impl Drop for WsFrameSender {
    fn drop(&mut self) {
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.abort();
        }
    }
}

struct WsFrameReceiver {
    read: SplitStream<WsStream>,
}

#[async_trait]
impl FrameReceiver for WsFrameReceiver {
    async fn next_frame(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.read.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Binary(data)) => {
                    log::debug!("Ignoring binary frame ({} bytes)", data.len());
                }
                Ok(Message::Close(frame)) => {
                    log::info!("Server closed connection: {:?}", frame);
                    return None;
                }
                Ok(_) => {
                    // ping/pong are handled by tungstenite
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

//! In-memory transport for tests. Each accepted connection hands a
//! [`MockServer`] to the test, which plays the agent side.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

use super::{
    ConnectOptions, Connection, FrameReceiver, FrameSender, Transport, TransportError,
};

type ServerFrame = Result<String, TransportError>;

#[derive(Clone)]
pub struct MockTransport {
    fail_next: Arc<AtomicU32>,
    attempts: Arc<AtomicUsize>,
    delay_ms: Arc<AtomicU64>,
    servers_tx: mpsc::UnboundedSender<MockServer>,
    servers_rx: Arc<Mutex<mpsc::UnboundedReceiver<MockServer>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        let (servers_tx, servers_rx) = mpsc::unbounded_channel();
        Self {
            fail_next: Arc::new(AtomicU32::new(0)),
            attempts: Arc::new(AtomicUsize::new(0)),
            delay_ms: Arc::new(AtomicU64::new(0)),
            servers_tx,
            servers_rx: Arc::new(Mutex::new(servers_rx)),
        }
    }

    /// Refuse the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Make every following connect take this long before it resolves.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Total connection attempts, successful or not.
    pub fn connect_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Wait for the client to open its next connection.
    pub async fn accept(&self) -> Option<MockServer> {
        self.servers_rx.lock().await.recv().await
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        endpoint: &str,
        _options: &ConnectOptions,
    ) -> Result<Connection, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let refused = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Refused(format!("mock refused {}", endpoint)));
        }

        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
        let (to_server_tx, to_server_rx) = mpsc::unbounded_channel();

        let server = MockServer {
            endpoint: endpoint.to_string(),
            to_client: Some(to_client_tx),
            from_client: to_server_rx,
        };
        self.servers_tx
            .send(server)
            .map_err(|_| TransportError::Refused("mock transport dropped".to_string()))?;

        Ok(Connection {
            sender: Box::new(MockFrameSender {
                tx: Some(to_server_tx),
            }),
            receiver: Box::new(MockFrameReceiver { rx: to_client_rx }),
        })
    }
}

/// Agent side of one mock connection
pub struct MockServer {
    pub endpoint: String,
    to_client: Option<mpsc::UnboundedSender<ServerFrame>>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl MockServer {
    pub fn send_text(&self, frame: impl Into<String>) {
        if let Some(tx) = &self.to_client {
            let _ = tx.send(Ok(frame.into()));
        }
    }

    pub fn send_json(&self, value: Value) {
        self.send_text(value.to_string());
    }

    /// Complete the handshake.
    pub fn create_session(&self, session_id: &str) {
        self.send_json(serde_json::json!({
            "type": "session_created",
            "session_id": session_id,
        }));
    }

    /// Next frame written by the client; `None` once the client closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    pub async fn recv_json(&mut self) -> Option<Value> {
        let frame = self.recv().await?;
        serde_json::from_str(&frame).ok()
    }

    /// Deliver a transport error to the client's reader.
    pub fn fail(&mut self, reason: &str) {
        if let Some(tx) = self.to_client.take() {
            let _ = tx.send(Err(TransportError::Refused(reason.to_string())));
        }
    }

    /// Close the connection from the server side.
    pub fn close(&mut self) {
        self.to_client.take();
    }
}

struct MockFrameSender {
    tx: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl FrameSender for MockFrameSender {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx.take();
        Ok(())
    }
}

struct MockFrameReceiver {
    rx: mpsc::UnboundedReceiver<ServerFrame>,
}

#[async_trait]
impl FrameReceiver for MockFrameReceiver {
    async fn next_frame(&mut self) -> Option<Result<String, TransportError>> {
        self.rx.recv().await
    }
}

//! Domain events delivered to the presentation layer

use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

const EVENT_BUFFER: usize = 256;

/// A product returned by the agent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductItem {
    pub id: String,
    pub title: String,
    pub price: Option<f64>,
    pub image_url: Option<String>,
}

/// Everything the client tells its subscribers about
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentEvent {
    Text {
        text: String,
    },
    Products {
        items: Vec<ProductItem>,
        title: Option<String>,
        follow_up: Option<String>,
    },
    Stt {
        text: String,
        is_final: bool,
    },
    /// Microphone level in [0, 1]
    AudioLevel {
        level: f32,
    },
    ToolStatus {
        tool_name: String,
        status: String,
    },
    Connection {
        is_connected: bool,
        session_id: Option<String>,
    },
    Error {
        message: String,
    },
}

impl AgentEvent {
    pub fn error(message: impl Into<String>) -> Self {
        AgentEvent::Error {
            message: message.into(),
        }
    }

    pub fn connected(session_id: impl Into<String>) -> Self {
        AgentEvent::Connection {
            is_connected: true,
            session_id: Some(session_id.into()),
        }
    }

    pub fn disconnected() -> Self {
        AgentEvent::Connection {
            is_connected: false,
            session_id: None,
        }
    }
}

/// Broadcast fan-out of [`AgentEvent`]s. Subscribers only see events published
/// after they subscribe. Once closed, nothing more is delivered.
#[derive(Clone)]
pub struct EventBus {
    tx: Arc<Mutex<Option<broadcast::Sender<AgentEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
        }
    }

    pub fn emit(&self, event: AgentEvent) {
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = guard.as_ref() {
            // no subscribers is fine
            let _ = tx.send(event);
        }
    }

    /// Subscribe to future events. A receiver taken after `close` reports
    /// the channel as closed immediately.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                rx
            }
        }
    }

    pub fn stream(&self) -> BroadcastStream<AgentEvent> {
        BroadcastStream::new(self.subscribe())
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        guard.as_ref().map_or(0, |tx| tx.receiver_count())
    }

    /// Drop the sender; receivers drain what is buffered, then see `Closed`.
    pub fn close(&self) {
        let mut guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        guard.take();
    }

    pub fn is_closed(&self) -> bool {
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        guard.is_none()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    #[tokio::test]
    async fn test_late_subscriber_sees_only_future_events() {
        let bus = EventBus::new();
        let mut early = bus.subscribe();
        bus.emit(AgentEvent::error("first"));

        let mut late = bus.subscribe();
        bus.emit(AgentEvent::error("second"));

        assert_eq!(early.recv().await.unwrap(), AgentEvent::error("first"));
        assert_eq!(early.recv().await.unwrap(), AgentEvent::error("second"));
        assert_eq!(late.recv().await.unwrap(), AgentEvent::error("second"));
    }

    #[tokio::test]
    async fn test_close_stops_delivery() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.close();
        bus.emit(AgentEvent::error("after close"));

        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
        assert!(bus.is_closed());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_after_close() {
        let bus = EventBus::new();
        bus.close();
        let mut rx = bus.subscribe();
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_value(AgentEvent::Stt {
            text: "hi".into(),
            is_final: true,
        })
        .unwrap();
        assert_eq!(json["kind"], "stt");
        assert_eq!(json["is_final"], true);
    }
}

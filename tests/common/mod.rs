use agent_session_client::capture::MockMicrophone;
use agent_session_client::transport::{MockServer, MockTransport};
use agent_session_client::{AgentClient, AgentEvent, ClientConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};

pub struct Harness {
    pub client: Arc<AgentClient>,
    pub transport: MockTransport,
    pub mic: Arc<MockMicrophone>,
    pub events: broadcast::Receiver<AgentEvent>,
}

pub fn harness() -> Harness {
    let config = ClientConfig::with_endpoint("ws://agent.test/ws").unwrap();
    harness_with(config)
}

pub fn harness_with(config: ClientConfig) -> Harness {
    let transport = MockTransport::new();
    let mic = Arc::new(MockMicrophone::new());
    let client = Arc::new(AgentClient::new(
        config,
        Arc::new(transport.clone()),
        mic.clone(),
    ));
    let events = client.subscribe();
    Harness {
        client,
        transport,
        mic,
        events,
    }
}

impl Harness {
    /// Connect and complete the handshake with the given session id.
    pub async fn connect_with_session(&mut self, session_id: &str) -> MockServer {
        self.client.connect().await.unwrap();
        let server = self.transport.accept().await.unwrap();
        server.create_session(session_id);
        assert_eq!(self.client.wait_for_session().await.unwrap(), session_id);
        server
    }

    /// Next event matching `pred`, skipping everything else.
    pub async fn next_event(&mut self, pred: impl Fn(&AgentEvent) -> bool) -> AgentEvent {
        let events = &mut self.events;
        tokio::time::timeout(Duration::from_secs(120), async {
            loop {
                match events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => panic!("event stream closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    pub async fn next_error(&mut self) -> String {
        match self.next_event(|e| matches!(e, AgentEvent::Error { .. })).await {
            AgentEvent::Error { message } => message,
            _ => unreachable!(),
        }
    }

    pub async fn next_connection(&mut self) -> AgentEvent {
        self.next_event(|e| matches!(e, AgentEvent::Connection { .. }))
            .await
    }
}

//! Public facade: one object wiring the session manager, the audio pipeline
//! and the event bus together.

use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

use crate::audio::{validate_buffer, AudioPipeline, QueueStats};
use crate::capture::MicrophoneSource;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::events::{AgentEvent, EventBus};
use crate::protocol;
use crate::session::{ConnectionState, SessionManager};
use crate::transport::Transport;

/// Realtime client for the voice/text agent.
///
/// Operations that the UI fires and forgets (`send_text`, `start_mic`)
/// report failures as [`AgentEvent::Error`] instead of returning them.
pub struct AgentClient {
    events: EventBus,
    session: Arc<SessionManager>,
    audio: Arc<AudioPipeline>,
    shutdown: CancellationToken,
}

impl AgentClient {
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        microphone: Arc<dyn MicrophoneSource>,
    ) -> Self {
        let config = Arc::new(config);
        let events = EventBus::new();
        let shutdown = CancellationToken::new();
        let (link_tx, link_rx) = watch::channel(None);

        let audio = Arc::new(AudioPipeline::new(
            Arc::clone(&config),
            microphone,
            link_rx,
            events.clone(),
            shutdown.clone(),
        ));
        let session = Arc::new(SessionManager::new(
            config,
            transport,
            events.clone(),
            Arc::clone(&audio),
            link_tx,
            shutdown.clone(),
        ));

        Self {
            events,
            session,
            audio,
            shutdown,
        }
    }

    /// Receiver for events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> BroadcastStream<AgentEvent> {
        self.events.stream()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.session.connection_state()
    }

    pub fn session_id(&self) -> Option<String> {
        self.session.session_id()
    }

    pub fn is_capturing(&self) -> bool {
        self.audio.is_capturing()
    }

    pub async fn audio_stats(&self) -> QueueStats {
        self.audio.stats().await
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(ClientError::Disposed);
        }
        Ok(())
    }

    /// Connect, or join a connect already in progress.
    pub async fn connect(&self) -> Result<()> {
        self.ensure_open()?;
        self.session.connect().await
    }

    /// Close the connection without reconnecting.
    pub async fn disconnect(&self) {
        self.session.disconnect().await;
    }

    /// Wait until the server has issued a session id.
    pub async fn wait_for_session(&self) -> Result<String> {
        self.ensure_open()?;
        self.session.connect().await?;
        self.session.wait_for_session_id().await
    }

    /// Ask the agent a question. Connects first if needed.
    pub async fn send_text(&self, text: &str) {
        if text.trim().is_empty() {
            log::debug!("Ignoring empty question");
            return;
        }
        if let Err(e) = self.try_send_text(text).await {
            log::error!("❌ Failed to send question: {}", e);
            self.events
                .emit(AgentEvent::error(format!("Failed to send message: {}", e)));
        }
    }

    async fn try_send_text(&self, text: &str) -> Result<()> {
        let session_id = self.wait_for_session().await?;
        let frame = protocol::question_frame(&session_id, text)?;
        let link = self.session.link().ok_or(ClientError::NotConnected)?;
        let mut sender = link.sender.lock().await;
        sender.send(frame).await?;
        log::debug!("📤 Question sent ({} chars)", text.len());
        Ok(())
    }

    /// Start streaming microphone audio. Connects and waits for a session
    /// first. Starting twice is a no-op.
    pub async fn start_mic(&self) {
        if let Err(e) = self.try_start_mic().await {
            log::error!("❌ Failed to start microphone: {}", e);
            self.audio.stop().await;
            let message = match e {
                ClientError::PermissionDenied => "Microphone permission denied".to_string(),
                e => format!("Failed to start microphone: {}", e),
            };
            self.events.emit(AgentEvent::error(message));
        }
    }

    async fn try_start_mic(&self) -> Result<()> {
        if self.audio.is_capturing() {
            return Ok(());
        }
        let session_id = self.wait_for_session().await?;
        let link = self
            .session
            .link()
            .filter(|link| link.session_id.as_deref() == Some(session_id.as_str()))
            .ok_or(ClientError::NotConnected)?;
        self.audio.start(session_id, link.generation).await
    }

    pub async fn stop_mic(&self) {
        self.audio.stop().await;
    }

    /// Send one PCM16 buffer directly, bypassing the capture queue.
    /// Requires a live session; nothing is buffered otherwise.
    pub async fn send_raw_chunk(&self, pcm: &[u8]) -> Result<()> {
        self.ensure_open()?;
        validate_buffer(pcm).map_err(|e| ClientError::Audio(e.to_string()))?;

        let link = self.session.link().ok_or(ClientError::NotConnected)?;
        let session_id = link.session_id.as_deref().ok_or(ClientError::NotConnected)?;
        let frame = protocol::audio_frame(session_id, pcm)?;
        let mut sender = link.sender.lock().await;
        sender.send(frame).await?;
        Ok(())
    }

    /// Drop the current session and connect again for a fresh one.
    pub async fn start_new_session(&self) -> Result<()> {
        self.ensure_open()?;
        self.session.start_new_session().await
    }

    /// Stop everything and close the event stream. The client is unusable
    /// afterwards.
    pub async fn dispose(&self) {
        if self.shutdown.is_cancelled() && self.events.is_closed() {
            return;
        }
        log::info!("Disposing agent client");
        self.session.shutdown().await;
        self.audio.stop().await;
        self.events.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::MockMicrophone;
    use crate::transport::MockTransport;

    fn client() -> (AgentClient, MockTransport) {
        let transport = MockTransport::new();
        let config = ClientConfig::with_endpoint("ws://localhost:9/agent").unwrap();
        let client = AgentClient::new(
            config,
            Arc::new(transport.clone()),
            Arc::new(MockMicrophone::new()),
        );
        (client, transport)
    }

    #[tokio::test]
    async fn test_starts_disconnected() {
        let (client, _) = client();
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert_eq!(client.session_id(), None);
        assert!(!client.is_capturing());
        assert_eq!(client.audio_stats().await, QueueStats::default());
    }

    #[tokio::test]
    async fn test_raw_chunk_requires_session() {
        let (client, _) = client();
        assert_eq!(
            client.send_raw_chunk(&[0u8; 640]).await,
            Err(ClientError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_raw_chunk_rejects_odd_length() {
        let (client, _) = client();
        assert!(matches!(
            client.send_raw_chunk(&[0u8; 3]).await,
            Err(ClientError::Audio(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_text_is_ignored() {
        let (client, transport) = client();
        client.send_text("   ").await;
        assert_eq!(transport.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_operations_fail_after_dispose() {
        let (client, transport) = client();
        client.dispose().await;
        assert_eq!(client.connect().await, Err(ClientError::Disposed));
        assert_eq!(
            client.start_new_session().await,
            Err(ClientError::Disposed)
        );
        assert_eq!(transport.connect_attempts(), 0);
    }
}

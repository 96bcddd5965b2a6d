//! Connection lifecycle, handshake and reconnection.
//!
//! The [`SessionManager`] is the only writer of connection state, the session
//! id and the transport handle. Everything else reads the current [`Link`]
//! through a `watch` channel.

pub mod backoff;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use strum::Display;
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::audio::AudioPipeline;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::events::{AgentEvent, EventBus};
use crate::router::{MessageRouter, Routed};
use crate::transport::{ConnectOptions, FrameReceiver, FrameSender, Transport};

pub use backoff::Backoff;

pub type SharedSender = Arc<AsyncMutex<Box<dyn FrameSender>>>;

type ConnectFuture = Shared<BoxFuture<'static, Result<()>>>;

/// An in-flight connect, valid only for the generation it started in.
/// Callers joining it may raise its attempt budget.
struct PendingConnect {
    generation: u64,
    attempts: Arc<AtomicU32>,
    future: ConnectFuture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Read-only view of the current connection handed to other components
#[derive(Clone)]
pub struct Link {
    pub generation: u64,
    pub session_id: Option<String>,
    pub sender: SharedSender,
}

struct ManagerState {
    state: ConnectionState,
    session_id: Option<String>,
    generation: u64,
    sender: Option<SharedSender>,
    reader: Option<JoinHandle<()>>,
    waiters: Vec<oneshot::Sender<Result<String>>>,
    pending_connect: Option<PendingConnect>,
    reconnect: Option<CancellationToken>,
    backoff: Backoff,
    router: MessageRouter,
}

pub struct SessionManager {
    config: Arc<ClientConfig>,
    transport: Arc<dyn Transport>,
    events: EventBus,
    audio: Arc<AudioPipeline>,
    link_tx: watch::Sender<Option<Link>>,
    shutdown: CancellationToken,
    inner: Mutex<ManagerState>,
}

impl SessionManager {
    pub fn new(
        config: Arc<ClientConfig>,
        transport: Arc<dyn Transport>,
        events: EventBus,
        audio: Arc<AudioPipeline>,
        link_tx: watch::Sender<Option<Link>>,
        shutdown: CancellationToken,
    ) -> Self {
        let backoff = Backoff::new(config.max_reconnect_attempts);
        Self {
            config,
            transport,
            events,
            audio,
            link_tx,
            shutdown,
            inner: Mutex::new(ManagerState {
                state: ConnectionState::Disconnected,
                session_id: None,
                generation: 0,
                sender: None,
                reader: None,
                waiters: Vec::new(),
                pending_connect: None,
                reconnect: None,
                backoff,
                router: MessageRouter::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ManagerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state().state
    }

    pub fn session_id(&self) -> Option<String> {
        self.state().session_id.clone()
    }

    pub fn link(&self) -> Option<Link> {
        self.link_tx.borrow().clone()
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.state().backoff.attempt()
    }

    /// Connect, or join the attempt already in flight. Resolves once the
    /// transport is up; the session id may still be pending.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(ClientError::Disposed);
        }
        if let Some(token) = self.state().reconnect.take() {
            token.cancel();
        }
        self.begin_connect(self.config.connect_attempts).await
    }

    fn begin_connect(self: &Arc<Self>, attempts: u32) -> ConnectFuture {
        let attempts = attempts.max(1);
        let mut st = self.state();
        if st.state == ConnectionState::Connected {
            return futures_util::future::ready(Ok(())).boxed().shared();
        }
        let generation = st.generation;
        if let Some(pending) = st
            .pending_connect
            .as_ref()
            .filter(|p| p.generation == generation)
        {
            pending.attempts.fetch_max(attempts, Ordering::SeqCst);
            return pending.future.clone();
        }

        st.state = ConnectionState::Connecting;
        let budget = Arc::new(AtomicU32::new(attempts));
        let this = Arc::clone(self);
        let future = {
            let budget = Arc::clone(&budget);
            async move { this.connect_with_retry(generation, budget).await }
                .boxed()
                .shared()
        };
        st.pending_connect = Some(PendingConnect {
            generation,
            attempts: budget,
            future: future.clone(),
        });
        future
    }

    async fn connect_with_retry(
        self: Arc<Self>,
        generation: u64,
        budget: Arc<AtomicU32>,
    ) -> Result<()> {
        let mut last_error = ClientError::NotConnected;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.establish(generation).await {
                Ok(()) => {
                    self.finish_connect(&budget);
                    return Ok(());
                }
                Err(e @ (ClientError::Cancelled | ClientError::Disposed)) => {
                    last_error = e;
                    break;
                }
                Err(e) => {
                    let attempts = budget.load(Ordering::SeqCst);
                    log::warn!("Connect attempt {}/{} failed: {}", attempt, attempts, e);
                    last_error = e;
                }
            }
            if attempt >= budget.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    last_error = ClientError::Disposed;
                    break;
                }
                _ = tokio::time::sleep(self.config.connect_retry_delay) => {}
            }
        }

        if self.finish_connect(&budget) {
            let waiters = {
                let mut st = self.state();
                if st.state == ConnectionState::Connecting {
                    st.state = ConnectionState::Disconnected;
                }
                std::mem::take(&mut st.waiters)
            };
            for waiter in waiters {
                let _ = waiter.send(Err(ClientError::DisconnectedBeforeSession));
            }
        }
        Err(last_error)
    }

    /// Drop the pending connect if it is still the one owning `budget`.
    /// Returns false when a teardown or a newer connect replaced it.
    fn finish_connect(&self, budget: &Arc<AtomicU32>) -> bool {
        let mut st = self.state();
        let owned = st
            .pending_connect
            .as_ref()
            .is_some_and(|p| Arc::ptr_eq(&p.attempts, budget));
        if owned {
            st.pending_connect = None;
        }
        owned
    }

    /// One transport connect for the given generation. On success the manager
    /// is Connected and a reader task is running for the next generation.
    async fn establish(self: &Arc<Self>, started_at: u64) -> Result<()> {
        if self.state().generation != started_at {
            return Err(ClientError::Cancelled);
        }
        let options = ConnectOptions {
            ping_interval: Some(self.config.ping_interval),
            connect_timeout: self.config.connect_timeout,
        };

        let endpoint = self.config.endpoint();
        let connection = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(ClientError::Disposed),
            result = tokio::time::timeout(
                self.config.connect_timeout,
                self.transport.connect(&endpoint, &options),
            ) => match result {
                Ok(Ok(connection)) => connection,
                Ok(Err(e)) => return Err(ClientError::Connection(e.to_string())),
                Err(_) => return Err(ClientError::ConnectTimeout(self.config.connect_timeout)),
            },
        };

        let sender: SharedSender = Arc::new(AsyncMutex::new(connection.sender));
        let generation = {
            let mut st = self.state();
            if st.generation != started_at || self.shutdown.is_cancelled() {
                None
            } else {
                st.generation += 1;
                st.state = ConnectionState::Connected;
                st.session_id = None;
                st.sender = Some(Arc::clone(&sender));
                st.backoff.reset();
                Some(st.generation)
            }
        };
        let Some(generation) = generation else {
            // disconnected while the transport was connecting
            let _ = sender.lock().await.close().await;
            return Err(ClientError::Cancelled);
        };
        self.link_tx.send_replace(Some(Link {
            generation,
            session_id: None,
            sender,
        }));

        let reader = tokio::spawn(Arc::clone(self).run_reader(generation, connection.receiver));
        self.state().reader = Some(reader);

        log::info!("✅ Connected to agent (connection #{})", generation);
        Ok(())
    }

    async fn run_reader(self: Arc<Self>, generation: u64, mut receiver: Box<dyn FrameReceiver>) {
        let reason = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                frame = receiver.next_frame() => match frame {
                    Some(Ok(text)) => self.handle_frame(generation, &text),
                    Some(Err(e)) => break format!("transport error: {}", e),
                    None => break "closed by server".to_string(),
                },
            }
        };
        self.handle_connection_lost(generation, &reason).await;
    }

    fn handle_frame(&self, generation: u64, frame: &str) {
        log::debug!("📨 Received frame: {}", frame);
        let routed = {
            let mut st = self.state();
            if st.generation != generation {
                return;
            }
            st.router.route(frame)
        };

        match routed {
            Some(Routed::SessionCreated(session_id)) => self.adopt_session(generation, session_id),
            Some(Routed::Event(event)) => self.events.emit(event),
            None => {}
        }
    }

    fn adopt_session(&self, generation: u64, session_id: String) {
        let waiters = {
            let mut st = self.state();
            if st.generation != generation {
                return;
            }
            st.session_id = Some(session_id.clone());
            std::mem::take(&mut st.waiters)
        };
        self.link_tx.send_modify(|link| {
            if let Some(link) = link.as_mut().filter(|l| l.generation == generation) {
                link.session_id = Some(session_id.clone());
            }
        });
        for waiter in waiters {
            let _ = waiter.send(Ok(session_id.clone()));
        }

        log::info!("🆔 Session created: {}", session_id);
        self.events.emit(AgentEvent::connected(session_id));
    }

    /// The current session id, or wait for the server to issue one.
    pub async fn wait_for_session_id(&self) -> Result<String> {
        let rx = {
            let mut st = self.state();
            if let Some(id) = &st.session_id {
                return Ok(id.clone());
            }
            if st.state == ConnectionState::Disconnected {
                return Err(ClientError::NotConnected);
            }
            let (tx, rx) = oneshot::channel();
            st.waiters.push(tx);
            rx
        };

        let timeout = self.config.session_wait_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::DisconnectedBeforeSession),
            Err(_) => Err(ClientError::SessionTimeout(timeout)),
        }
    }

    async fn handle_connection_lost(self: &Arc<Self>, generation: u64, reason: &str) {
        {
            let mut st = self.state();
            if st.generation != generation || st.state != ConnectionState::Connected {
                return;
            }
            // this task is the reader; don't abort it
            st.reader.take();
        }
        log::warn!("⚠️ Connection lost: {}", reason);
        self.teardown().await;
        self.schedule_reconnect();
    }

    /// Close the connection and reset all per-connection state.
    async fn teardown(&self) {
        self.audio.stop().await;

        let (was_active, sender, reader, waiters) = {
            let mut st = self.state();
            let was_active = st.state != ConnectionState::Disconnected || st.sender.is_some();
            st.state = ConnectionState::Disconnected;
            st.session_id = None;
            st.router.clear();
            // an in-flight connect belongs to the old generation
            st.pending_connect = None;
            st.generation += 1;
            (
                was_active,
                st.sender.take(),
                st.reader.take(),
                std::mem::take(&mut st.waiters),
            )
        };
        self.link_tx.send_replace(None);

        if let Some(sender) = sender {
            if let Err(e) = sender.lock().await.close().await {
                log::debug!("Error closing transport: {}", e);
            }
        }
        if let Some(reader) = reader {
            reader.abort();
        }

        for waiter in waiters {
            let _ = waiter.send(Err(ClientError::DisconnectedBeforeSession));
        }
        if was_active {
            self.events.emit(AgentEvent::disconnected());
            log::info!("🔌 Disconnected");
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let token = self.shutdown.child_token();
        if let Some(previous) = self.state().reconnect.replace(token.clone()) {
            previous.cancel();
        }
        tokio::spawn(Arc::clone(self).reconnect_with_backoff(token));
    }

    async fn reconnect_with_backoff(self: Arc<Self>, token: CancellationToken) {
        loop {
            let delay = self.state().backoff.next_delay();
            let Some(delay) = delay else {
                let attempts = self.config.max_reconnect_attempts;
                log::error!("❌ Giving up after {} reconnect attempts", attempts);
                self.events.emit(AgentEvent::error(format!(
                    "Connection lost. Gave up after {} reconnect attempts",
                    attempts
                )));
                self.clear_reconnect(&token);
                return;
            };

            let attempt = self.reconnect_attempt();
            log::info!("🔄 Reconnecting in {:?} (attempt {})", delay, attempt);
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = self.begin_connect(1) => result,
            };
            match result {
                Ok(()) => {
                    log::info!("✅ Reconnected after {} attempt(s)", attempt);
                    self.clear_reconnect(&token);
                    return;
                }
                Err(e) => log::warn!("Reconnect attempt {} failed: {}", attempt, e),
            }
        }
    }

    fn clear_reconnect(&self, token: &CancellationToken) {
        // a replaced reconnect token is always cancelled first
        if !token.is_cancelled() {
            self.state().reconnect = None;
        }
    }

    /// Explicit disconnect. No automatic reconnect follows.
    pub async fn disconnect(&self) {
        if let Some(token) = self.state().reconnect.take() {
            token.cancel();
        }
        self.teardown().await;
    }

    /// Drop the current session and connect again for a fresh session id.
    pub async fn start_new_session(self: &Arc<Self>) -> Result<()> {
        log::info!("Starting a new session");
        self.disconnect().await;
        self.connect().await
    }

    /// Tear everything down for good.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::MockMicrophone;
    use crate::transport::MockTransport;
    use std::time::Duration;

    fn manager(transport: &MockTransport) -> Arc<SessionManager> {
        let config = Arc::new(ClientConfig::with_endpoint("ws://agent.test/ws").unwrap());
        let events = EventBus::new();
        let shutdown = CancellationToken::new();
        let (link_tx, link_rx) = watch::channel(None);
        let audio = Arc::new(AudioPipeline::new(
            Arc::clone(&config),
            Arc::new(MockMicrophone::new()),
            link_rx,
            events.clone(),
            shutdown.clone(),
        ));
        Arc::new(SessionManager::new(
            config,
            Arc::new(transport.clone()),
            events,
            audio,
            link_tx,
            shutdown,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connect_releases_session_waiters() {
        let transport = MockTransport::new();
        transport.fail_next_connects(10);
        let manager = manager(&transport);

        let connecting = Arc::clone(&manager);
        let connect = tokio::spawn(async move { connecting.connect().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.connection_state(), ConnectionState::Connecting);

        let started = tokio::time::Instant::now();
        assert_eq!(
            manager.wait_for_session_id().await,
            Err(ClientError::DisconnectedBeforeSession)
        );
        // released when the retries ran out, not at the session timeout
        assert!(started.elapsed() < Duration::from_secs(2));

        let result = connect.await.unwrap();
        assert!(matches!(result, Err(ClientError::Connection(_))), "{:?}", result);
        assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
        assert!(manager.state().pending_connect.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_forgets_in_flight_connect() {
        let transport = MockTransport::new();
        transport.set_connect_delay(Duration::from_secs(3));
        let manager = manager(&transport);

        let connecting = Arc::clone(&manager);
        let stale = tokio::spawn(async move { connecting.connect().await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        manager.disconnect().await;
        assert!(manager.state().pending_connect.is_none());

        assert_eq!(stale.await.unwrap(), Err(ClientError::Cancelled));
        assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
        assert!(manager.link().is_none());
    }
}

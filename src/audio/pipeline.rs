//! Capture → chunk → queue → wire.
//!
//! One capture session owns a capture task (fed by the microphone channel)
//! and at most one send loop. Stopping is the single cancellation point:
//! the capture subscription is cancelled first, then the queue is cleared,
//! then the microphone is stopped and the level meter falls back to zero.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{AudioQueue, Chunker, DropRateMonitor, LevelMeter, QueueStats};
use crate::capture::{CaptureFormat, MicrophoneSource};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::events::{AgentEvent, EventBus};
use crate::protocol;
use crate::session::Link;

pub struct AudioPipeline {
    config: Arc<ClientConfig>,
    microphone: Arc<dyn MicrophoneSource>,
    link: watch::Receiver<Option<Link>>,
    events: EventBus,
    shutdown: CancellationToken,
    active: tokio::sync::Mutex<Option<ActiveCapture>>,
    capturing: AtomicBool,
    last_stats: Mutex<QueueStats>,
}

struct ActiveCapture {
    shared: Arc<CaptureSession>,
    capture_task: JoinHandle<()>,
}

/// State shared by the capture task and the send loop of one capture session
struct CaptureSession {
    session_id: String,
    generation: u64,
    queue: AudioQueue,
    cancel: CancellationToken,
    sending: AtomicBool,
    send_task: Mutex<Option<JoinHandle<()>>>,
    monitor: Mutex<DropRateMonitor>,
}

impl AudioPipeline {
    pub fn new(
        config: Arc<ClientConfig>,
        microphone: Arc<dyn MicrophoneSource>,
        link: watch::Receiver<Option<Link>>,
        events: EventBus,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            microphone,
            link,
            events,
            shutdown,
            active: tokio::sync::Mutex::new(None),
            capturing: AtomicBool::new(false),
            last_stats: Mutex::new(QueueStats::default()),
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    /// Counters of the running capture session, or of the last one.
    pub async fn stats(&self) -> QueueStats {
        match self.active.lock().await.as_ref() {
            Some(active) => active.shared.queue.stats(),
            None => *self.last_stats.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Start capturing for the given session. Starting while already
    /// capturing is a no-op.
    pub async fn start(self: &Arc<Self>, session_id: String, generation: u64) -> Result<()> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            log::debug!("Microphone already capturing");
            return Ok(());
        }
        if self.shutdown.is_cancelled() {
            return Err(ClientError::Disposed);
        }
        if !self.microphone.has_permission().await {
            return Err(ClientError::PermissionDenied);
        }

        let rx = match self.microphone.start(CaptureFormat::default()).await {
            Ok(rx) => rx,
            Err(e) => {
                if let Err(stop_err) = self.microphone.stop().await {
                    log::debug!("Microphone stop after failed start: {}", stop_err);
                }
                return Err(e.into());
            }
        };

        let shared = Arc::new(CaptureSession {
            session_id,
            generation,
            queue: AudioQueue::new(self.config.backlog_chunks()),
            cancel: self.shutdown.child_token(),
            sending: AtomicBool::new(false),
            send_task: Mutex::new(None),
            monitor: Mutex::new(DropRateMonitor::new(
                self.config.drop_check_interval,
                self.config.drop_warning_threshold,
            )),
        });

        let capacity = shared.queue.capacity();
        let capture_task = tokio::spawn(Arc::clone(self).run_capture(Arc::clone(&shared), rx));
        *active = Some(ActiveCapture {
            shared,
            capture_task,
        });
        self.capturing.store(true, Ordering::SeqCst);

        log::info!(
            "🎤 Microphone capture started ({} byte chunks, backlog {} chunks)",
            self.config.chunk_bytes(),
            capacity
        );
        Ok(())
    }

    /// Stop the current capture session, if any.
    pub async fn stop(&self) {
        self.stop_session(None).await;
    }

    /// Stop only if `expected` is still the active session.
    async fn stop_session(&self, expected: Option<&Arc<CaptureSession>>) {
        let active = {
            let mut guard = self.active.lock().await;
            match (guard.as_ref(), expected) {
                (Some(current), Some(expected)) if !Arc::ptr_eq(&current.shared, expected) => {
                    return
                }
                _ => guard.take(),
            }
        };
        let Some(active) = active else {
            return;
        };

        active.shared.cancel.cancel();
        if let Err(e) = active.capture_task.await {
            if !e.is_cancelled() {
                log::error!("Capture task failed: {}", e);
            }
        }
        // the capture task is gone, so no new send loop can be spawned
        let send_task = active
            .shared
            .send_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(send_task) = send_task {
            if let Err(e) = send_task.await {
                if !e.is_cancelled() {
                    log::error!("Audio send loop failed: {}", e);
                }
            }
        }

        let cleared = active.shared.queue.clear();
        if let Err(e) = self.microphone.stop().await {
            log::warn!("Failed to stop microphone: {}", e);
        }

        let stats = active.shared.queue.stats();
        *self.last_stats.lock().unwrap_or_else(PoisonError::into_inner) = stats;
        self.capturing.store(false, Ordering::SeqCst);
        self.events.emit(AgentEvent::AudioLevel { level: 0.0 });

        log::info!(
            "🎤 Microphone capture stopped (sent {}, dropped {}, discarded {})",
            stats.sent,
            stats.dropped,
            cleared
        );
    }

    /// The connection this capture session belongs to, if it is still up.
    fn live_link(&self, session: &CaptureSession) -> Option<Link> {
        let link = self.link.borrow();
        link.as_ref()
            .filter(|l| l.generation == session.generation && l.session_id.is_some())
            .cloned()
    }

    async fn run_capture(
        self: Arc<Self>,
        session: Arc<CaptureSession>,
        mut rx: mpsc::Receiver<Vec<u8>>,
    ) {
        let mut chunker = Chunker::new(self.config.chunk_bytes());
        let mut meter = LevelMeter::new(self.config.level.clone());
        let stall_timeout = self.config.capture_stall_timeout;

        let failure: Option<String> = 'capture: loop {
            let buffer = tokio::select! {
                _ = session.cancel.cancelled() => break None,
                received = tokio::time::timeout(stall_timeout, rx.recv()) => match received {
                    Ok(Some(buffer)) => buffer,
                    Ok(None) => break Some("Microphone stream ended unexpectedly".to_string()),
                    Err(_) => {
                        break Some(format!("No audio from microphone for {:?}", stall_timeout))
                    }
                },
            };

            let chunks = match chunker.push(&buffer) {
                Ok(chunks) => chunks,
                Err(_) => continue,
            };

            if let Some(level) = meter.process(&buffer, Instant::now()) {
                self.events.emit(AgentEvent::AudioLevel { level });
            }

            for chunk in chunks {
                if self.live_link(&session).is_none() {
                    log::warn!("Connection not live, stopping microphone capture");
                    session.cancel.cancel();
                    break 'capture None;
                }
                session.queue.push(chunk);
                self.ensure_send_loop(&session);
            }
        };

        log::debug!(
            "Capture task ended ({} buffers rejected, {} bytes left unchunked)",
            chunker.rejected_buffers(),
            chunker.pending_bytes()
        );
        if let Some(reason) = &failure {
            log::warn!("🎤 {}", reason);
            self.events.emit(AgentEvent::error(reason.clone()));
        }

        // Self-initiated stop runs on its own task so it can await this one.
        if failure.is_some() || session.cancel.is_cancelled() {
            let this = Arc::clone(&self);
            tokio::spawn(async move { this.stop_session(Some(&session)).await });
        }
    }

    fn ensure_send_loop(self: &Arc<Self>, session: &Arc<CaptureSession>) {
        if session.sending.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let shared = Arc::clone(session);
        let handle = tokio::spawn(async move {
            this.run_send_loop(&shared).await;
            shared.sending.store(false, Ordering::SeqCst);
        });
        *session
            .send_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    async fn run_send_loop(&self, session: &CaptureSession) {
        log::debug!("Audio send loop started");
        let poll_interval = self.config.send_poll_interval;

        loop {
            if session.cancel.is_cancelled() {
                break;
            }
            let Some(link) = self.live_link(session) else {
                log::debug!("Connection no longer live, audio send loop exiting");
                break;
            };

            let Some(chunk) = session.queue.pop() else {
                tokio::select! {
                    _ = session.cancel.cancelled() => break,
                    _ = session.queue.notified() => {}
                    _ = tokio::time::sleep(poll_interval) => {}
                }
                continue;
            };

            let frame = match protocol::audio_frame(&session.session_id, &chunk) {
                Ok(frame) => frame,
                Err(e) => {
                    log::error!("Failed to encode audio chunk: {}", e);
                    continue;
                }
            };

            let sent = tokio::select! {
                _ = session.cancel.cancelled() => break,
                sent = async { link.sender.lock().await.send(frame).await } => sent,
            };
            if let Err(e) = sent {
                // connection loss is handled by the reader
                log::warn!("Audio send failed, send loop exiting: {}", e);
                break;
            }

            let total = session.queue.mark_sent();
            log::trace!("Sent audio chunk {} ({} bytes)", total, chunk.len());

            let stats = session.queue.stats();
            let warning = session
                .monitor
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .check(&stats);
            if let Some(rate) = warning {
                log::warn!(
                    "Audio drop rate {:.1}% ({} of {} chunks)",
                    rate * 100.0,
                    stats.dropped,
                    stats.sent
                );
                self.events.emit(AgentEvent::error(format!(
                    "Audio quality degraded: {:.0}% of audio was dropped due to a slow connection",
                    rate * 100.0
                )));
            }

            tokio::task::yield_now().await;
        }
    }
}

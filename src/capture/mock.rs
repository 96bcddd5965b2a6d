use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;

use super::{CaptureError, CaptureFormat, MicrophoneSource};

/// Scripted microphone for tests: the test pushes buffers with [`feed`](Self::feed).
pub struct MockMicrophone {
    permission: AtomicBool,
    fail_start: AtomicBool,
    tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl MockMicrophone {
    pub fn new() -> Self {
        Self {
            permission: AtomicBool::new(true),
            fail_start: AtomicBool::new(false),
            tx: Mutex::new(None),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }

    pub fn set_permission(&self, granted: bool) {
        self.permission.store(granted, Ordering::SeqCst);
    }

    pub fn fail_next_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Deliver a captured buffer. Returns false if capture is not running.
    pub async fn feed(&self, buffer: Vec<u8>) -> bool {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match tx {
            Some(tx) => tx.send(buffer).await.is_ok(),
            None => false,
        }
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl Default for MockMicrophone {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MicrophoneSource for MockMicrophone {
    async fn has_permission(&self) -> bool {
        self.permission.load(Ordering::SeqCst)
    }

    async fn start(&self, _format: CaptureFormat) -> Result<mpsc::Receiver<Vec<u8>>, CaptureError> {
        if self.fail_start.swap(false, Ordering::SeqCst) {
            return Err(CaptureError::Device("mock device unavailable".to_string()));
        }
        let mut slot = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return Err(CaptureError::AlreadyStarted);
        }
        let (tx, rx) = mpsc::channel(64);
        *slot = Some(tx);
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(rx)
    }

    async fn stop(&self) -> Result<(), CaptureError> {
        let mut slot = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.take().is_some() {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

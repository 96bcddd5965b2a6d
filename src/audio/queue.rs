use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

use super::AudioChunk;

/// Counters for one capture session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub sent: u64,
    pub dropped: u64,
}

impl QueueStats {
    pub fn drop_rate(&self) -> f64 {
        if self.sent == 0 {
            0.0
        } else {
            self.dropped as f64 / self.sent as f64
        }
    }
}

/// Bounded outbound audio queue. When full, the oldest chunk is evicted so the
/// newest audio always gets through. The capture side never blocks.
pub struct AudioQueue {
    chunks: ArrayQueue<AudioChunk>,
    ready: Notify,
    enqueued: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl AudioQueue {
    pub fn new(max_chunks: usize) -> Self {
        Self {
            chunks: ArrayQueue::new(max_chunks.max(1)),
            ready: Notify::new(),
            enqueued: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Append a chunk, evicting from the head if the bound is reached.
    /// Returns true if a chunk was dropped.
    pub fn push(&self, chunk: AudioChunk) -> bool {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        let evicted = self.chunks.force_push(chunk).is_some();
        if evicted {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            log::trace!("Audio backlog full, dropped oldest chunk ({} total)", dropped);
        }
        self.ready.notify_one();
        evicted
    }

    pub fn pop(&self) -> Option<AudioChunk> {
        self.chunks.pop()
    }

    /// Wait until a chunk may be available
    pub async fn notified(&self) {
        self.ready.notified().await
    }

    /// Count a chunk as transmitted; returns the new sent total.
    pub fn mark_sent(&self) -> u64 {
        self.sent.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Discard everything queued. Returns how many chunks were removed.
    pub fn clear(&self) -> usize {
        let mut removed = 0;
        while self.chunks.pop().is_some() {
            removed += 1;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.chunks.capacity()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Periodic drop-rate check. Warns at most once per capture session.
#[derive(Debug)]
pub struct DropRateMonitor {
    check_interval: u64,
    threshold: f64,
    warned: bool,
}

impl DropRateMonitor {
    pub fn new(check_interval: u64, threshold: f64) -> Self {
        Self {
            check_interval: check_interval.max(1),
            threshold,
            warned: false,
        }
    }

    /// Call after each transmitted chunk. Returns the drop rate when a
    /// checkpoint is reached, the rate is over threshold, and no warning has
    /// been issued yet.
    pub fn check(&mut self, stats: &QueueStats) -> Option<f64> {
        if self.warned || stats.sent == 0 || stats.sent % self.check_interval != 0 {
            return None;
        }
        let rate = stats.drop_rate();
        log::debug!(
            "Audio drop rate {:.1}% ({} dropped / {} sent)",
            rate * 100.0,
            stats.dropped,
            stats.sent
        );
        if rate > self.threshold {
            self.warned = true;
            Some(rate)
        } else {
            None
        }
    }
}

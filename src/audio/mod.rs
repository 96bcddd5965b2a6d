pub mod chunker;
pub mod level;
pub mod pipeline;
pub mod queue;
pub mod validation;

use std::time::Duration;

pub use chunker::Chunker;
pub use level::{LevelMeter, LevelMeterConfig};
pub use pipeline::AudioPipeline;
pub use queue::{AudioQueue, DropRateMonitor, QueueStats};
pub use validation::{validate_buffer, AudioFormatError, BufferDiagnostics, BufferKind};

/// Wire format: 16 kHz, mono, signed 16-bit little-endian PCM.
pub const SAMPLE_RATE: u32 = 16_000;
pub const CHANNELS: u16 = 1;
pub const BYTES_PER_SAMPLE: usize = 2;

/// A fixed-size block of PCM16 bytes ready for the wire.
pub type AudioChunk = Vec<u8>;

/// Byte length of one wire chunk of the given duration.
pub fn chunk_size_bytes(duration: Duration) -> usize {
    let samples = SAMPLE_RATE as u128 * duration.as_micros() / 1_000_000;
    samples as usize * BYTES_PER_SAMPLE * CHANNELS as usize
}

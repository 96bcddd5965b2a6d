//! Structural checks and diagnostics for captured PCM16 buffers

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioFormatError {
    #[error("Empty audio buffer")]
    Empty,
    #[error("Odd byte count {0}, not a whole number of 16-bit samples")]
    OddLength(usize),
}

/// What an accepted buffer contains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// All zero bytes. Still sent: the server relies on continuous silence for VAD.
    Silence,
    Signal,
}

/// Reject buffers that cannot be read as 16-bit samples. Everything else passes.
pub fn validate_buffer(buffer: &[u8]) -> Result<BufferKind, AudioFormatError> {
    if buffer.is_empty() {
        return Err(AudioFormatError::Empty);
    }
    if buffer.len() % 2 != 0 {
        return Err(AudioFormatError::OddLength(buffer.len()));
    }
    if buffer.iter().all(|&b| b == 0) {
        Ok(BufferKind::Silence)
    } else {
        Ok(BufferKind::Signal)
    }
}

/// Iterate little-endian i16 samples. A trailing odd byte is ignored.
pub fn samples_le(buffer: &[u8]) -> impl Iterator<Item = i16> + '_ {
    buffer
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
}

/// Snapshot of a buffer's shape, logged once per capture session.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferDiagnostics {
    pub byte_len: usize,
    pub sample_count: usize,
    pub is_silence: bool,
    pub peak: u16,
    pub rms: f32,
    pub likely_big_endian: bool,
}

impl BufferDiagnostics {
    pub fn inspect(buffer: &[u8]) -> Self {
        let sample_count = buffer.len() / 2;
        let mut peak = 0u16;
        let mut sum_sq = 0f64;
        for s in samples_le(buffer) {
            peak = peak.max(s.unsigned_abs());
            sum_sq += (s as f64) * (s as f64);
        }
        let rms = if sample_count > 0 {
            (sum_sq / sample_count as f64).sqrt() as f32
        } else {
            0.0
        };

        Self {
            byte_len: buffer.len(),
            sample_count,
            is_silence: peak == 0,
            peak,
            rms,
            likely_big_endian: looks_big_endian(buffer),
        }
    }

    pub fn log(&self) {
        log::info!(
            "🎤 First capture buffer: {} bytes ({} samples), peak {}, rms {:.1}{}",
            self.byte_len,
            self.sample_count,
            self.peak,
            self.rms,
            if self.is_silence { " (silence)" } else { "" }
        );
        if self.likely_big_endian {
            log::warn!("🎤 Capture buffer looks big-endian; expected PCM16 little-endian");
        }
    }
}

/// Byte-order heuristic: real audio is smooth, so sample-to-sample jumps are far
/// smaller when the bytes are read in the right order.
fn looks_big_endian(buffer: &[u8]) -> bool {
    if buffer.len() < 64 {
        return false;
    }

    let roughness = |swap: bool| -> f64 {
        let mut prev: Option<i16> = None;
        let mut total = 0f64;
        for pair in buffer.chunks_exact(2) {
            let s = if swap {
                i16::from_be_bytes([pair[0], pair[1]])
            } else {
                i16::from_le_bytes([pair[0], pair[1]])
            };
            if let Some(p) = prev {
                total += (s as f64 - p as f64).abs();
            }
            prev = Some(s);
        }
        total
    };

    let le = roughness(false);
    let be = roughness(true);
    le > 0.0 && be * 4.0 < le
}

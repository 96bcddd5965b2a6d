use super::validation::{validate_buffer, AudioFormatError, BufferDiagnostics, BufferKind};
use super::AudioChunk;

/// Turns irregular capture buffers into fixed-size wire chunks.
pub struct Chunker {
    chunk_bytes: usize,
    remainder: Vec<u8>,
    first_buffer_seen: bool,
    rejected: u64,
}

impl Chunker {
    pub fn new(chunk_bytes: usize) -> Self {
        assert!(chunk_bytes > 0, "chunk size must be positive");
        Self {
            chunk_bytes,
            remainder: Vec::with_capacity(chunk_bytes * 2),
            first_buffer_seen: false,
            rejected: 0,
        }
    }

    /// Validate and absorb one captured buffer, returning every complete chunk
    /// now available. Rejected buffers leave the remainder untouched.
    pub fn push(&mut self, buffer: &[u8]) -> Result<Vec<AudioChunk>, AudioFormatError> {
        let kind = match validate_buffer(buffer) {
            Ok(kind) => kind,
            Err(e) => {
                self.rejected += 1;
                log::debug!("Skipping capture buffer: {}", e);
                return Err(e);
            }
        };

        if !self.first_buffer_seen {
            self.first_buffer_seen = true;
            BufferDiagnostics::inspect(buffer).log();
        }
        if kind == BufferKind::Silence {
            log::trace!("Silence buffer ({} bytes)", buffer.len());
        }

        self.remainder.extend_from_slice(buffer);

        let mut chunks = Vec::with_capacity(self.remainder.len() / self.chunk_bytes);
        while self.remainder.len() >= self.chunk_bytes {
            let rest = self.remainder.split_off(self.chunk_bytes);
            chunks.push(std::mem::replace(&mut self.remainder, rest));
        }
        Ok(chunks)
    }

    /// Bytes waiting for a full chunk
    pub fn pending_bytes(&self) -> usize {
        self.remainder.len()
    }

    pub fn rejected_buffers(&self) -> u64 {
        self.rejected
    }

}

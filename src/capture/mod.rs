//! Microphone seam. The audio pipeline consumes raw PCM16 LE byte buffers
//! from whatever [`MicrophoneSource`] the client was built with.

pub mod imp_cpal;
pub mod mock;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::audio::{CHANNELS, SAMPLE_RATE};

pub use imp_cpal::CpalMicrophone;
pub use mock::MockMicrophone;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Microphone permission denied")]
    PermissionDenied,
    #[error("Audio device error: {0}")]
    Device(String),
    #[error("Audio stream error: {0}")]
    Stream(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Capture already started")]
    AlreadyStarted,
}

/// Format the pipeline asks the microphone for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for CaptureFormat {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            channels: CHANNELS,
        }
    }
}

#[async_trait]
pub trait MicrophoneSource: Send + Sync {
    async fn has_permission(&self) -> bool;

    /// Start capturing. Buffers arrive on the returned channel in capture
    /// order, with arbitrary sizes.
    async fn start(&self, format: CaptureFormat) -> Result<mpsc::Receiver<Vec<u8>>, CaptureError>;

    /// Stop capturing. Stopping an idle source is not an error.
    async fn stop(&self) -> Result<(), CaptureError>;
}

use async_trait::async_trait;
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Device, FromSample, Sample, SampleFormat, SizedSample, Stream as CpalStream,
};
use std::sync::{mpsc as std_mpsc, Mutex, PoisonError};
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};

use super::{CaptureError, CaptureFormat, MicrophoneSource};

const BUFFER_CHANNEL_DEPTH: usize = 64;

/// Microphone capture using CPAL.
///
/// `cpal::Stream` is not `Send`, so each capture session owns a dedicated
/// thread that builds the stream, keeps it alive, and drops it on stop.
pub struct CpalMicrophone {
    device_name: Option<String>,
    session: Mutex<Option<CaptureThread>>,
}

struct CaptureThread {
    stop_tx: std_mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl CpalMicrophone {
    /// Capture from the named input device, or the default one.
    pub fn new(device_name: Option<String>) -> Self {
        Self {
            device_name,
            session: Mutex::new(None),
        }
    }

    fn find_device(device_name: Option<&str>) -> Result<Device, CaptureError> {
        let host = cpal::default_host();
        match device_name {
            Some(name) => host
                .input_devices()
                .map_err(|e| CaptureError::Device(format!("Failed to enumerate devices: {}", e)))?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| CaptureError::Device(format!("Device '{}' not found", name))),
            None => host
                .default_input_device()
                .ok_or_else(|| CaptureError::Device("No default input device available".into())),
        }
    }

    fn open_stream(
        device_name: Option<&str>,
        format: CaptureFormat,
        tx: mpsc::Sender<Vec<u8>>,
    ) -> Result<CpalStream, CaptureError> {
        let device = Self::find_device(device_name)?;

        let supported = device
            .supported_input_configs()
            .map_err(|e| CaptureError::Config(e.to_string()))?
            .find(|c| {
                c.min_sample_rate().0 <= format.sample_rate
                    && c.max_sample_rate().0 >= format.sample_rate
            })
            .ok_or_else(|| {
                CaptureError::Config(format!(
                    "Input device does not support {}Hz capture",
                    format.sample_rate
                ))
            })?
            .with_sample_rate(cpal::SampleRate(format.sample_rate));

        let stream_config = cpal::StreamConfig {
            channels: supported.channels(),
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        log::info!(
            "🎤 Audio capture configured: {} channels @ {}Hz (format: {:?})",
            stream_config.channels,
            format.sample_rate,
            supported.sample_format()
        );

        let stream = match supported.sample_format() {
            SampleFormat::I16 => Self::build_stream::<i16>(&device, &stream_config, tx)?,
            SampleFormat::U16 => Self::build_stream::<u16>(&device, &stream_config, tx)?,
            SampleFormat::F32 => Self::build_stream::<f32>(&device, &stream_config, tx)?,
            other => {
                return Err(CaptureError::Config(format!(
                    "Unsupported sample format: {:?}",
                    other
                )))
            }
        };

        stream
            .play()
            .map_err(|e| CaptureError::Stream(format!("Failed to start stream: {}", e)))?;
        Ok(stream)
    }

    fn build_stream<T>(
        device: &Device,
        config: &cpal::StreamConfig,
        tx: mpsc::Sender<Vec<u8>>,
    ) -> Result<CpalStream, CaptureError>
    where
        T: Sample + SizedSample + Send + Sync + 'static,
        i16: FromSample<T>,
    {
        let channels = config.channels as usize;

        device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    // first channel only, as PCM16 LE
                    let mut bytes = Vec::with_capacity(data.len() / channels * 2);
                    for frame in data.chunks(channels) {
                        if let Some(sample) = frame.first() {
                            bytes.extend_from_slice(&i16::from_sample(*sample).to_le_bytes());
                        }
                    }
                    if tx.try_send(bytes).is_err() {
                        log::trace!("Capture consumer behind or gone, buffer skipped");
                    }
                },
                |err| log::error!("Audio stream error: {}", err),
                None,
            )
            .map_err(|e| CaptureError::Stream(e.to_string()))
    }
}

impl Default for CpalMicrophone {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl MicrophoneSource for CpalMicrophone {
    async fn has_permission(&self) -> bool {
        // Desktop hosts have no permission prompt; an input device is enough.
        Self::find_device(self.device_name.as_deref()).is_ok()
    }

    async fn start(&self, format: CaptureFormat) -> Result<mpsc::Receiver<Vec<u8>>, CaptureError> {
        if self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
        {
            return Err(CaptureError::AlreadyStarted);
        }

        let (tx, rx) = mpsc::channel(BUFFER_CHANNEL_DEPTH);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let device_name = self.device_name.clone();

        let handle = std::thread::Builder::new()
            .name("cpal-capture".to_string())
            .spawn(move || match Self::open_stream(device_name.as_deref(), format, tx) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    // blocks until stop() or the sender is dropped
                    let _ = stop_rx.recv();
                    drop(stream);
                    log::debug!("Capture stream dropped");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| CaptureError::Stream(format!("Failed to spawn capture thread: {}", e)))?;

        match ready_rx.await {
            Ok(Ok(())) => {
                *self.session.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(CaptureThread { stop_tx, handle });
                Ok(rx)
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => Err(CaptureError::Stream("Capture thread exited".to_string())),
        }
    }

    async fn stop(&self) -> Result<(), CaptureError> {
        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            let _ = session.stop_tx.send(());
            tokio::task::spawn_blocking(move || session.handle.join())
                .await
                .map_err(|e| CaptureError::Stream(e.to_string()))?
                .map_err(|_| CaptureError::Stream("Capture thread panicked".to_string()))?;
        }
        Ok(())
    }
}

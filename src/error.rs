use std::time::Duration;
use thiserror::Error;

use crate::capture::CaptureError;
use crate::config::ConfigError;
use crate::transport::TransportError;

pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors surfaced by the session client.
///
/// `Clone` so a single connect outcome can be handed to every caller that
/// joined the same in-flight attempt.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Disconnected before session established")]
    DisconnectedBeforeSession,

    #[error("Timed out waiting for session after {0:?}")]
    SessionTimeout(Duration),

    #[error("Connect cancelled")]
    Cancelled,

    #[error("Audio error: {0}")]
    Audio(String),

    #[error("Microphone permission denied")]
    PermissionDenied,

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Client has been disposed")]
    Disposed,
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed => ClientError::NotConnected,
            other => ClientError::Transport(other.to_string()),
        }
    }
}

impl From<CaptureError> for ClientError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::PermissionDenied => ClientError::PermissionDenied,
            other => ClientError::Capture(other.to_string()),
        }
    }
}

impl From<ConfigError> for ClientError {
    fn from(err: ConfigError) -> Self {
        ClientError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Protocol(err.to_string())
    }
}

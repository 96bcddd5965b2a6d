use secrecy::{ExposeSecret, SecretString};
use std::env;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::audio::level::LevelMeterConfig;

/// Query parameter carrying the application identifier on the base endpoint.
pub const APP_ID_PARAM: &str = "app_id";

pub const DEFAULT_BASE_URL: &str = "wss://agent.example.com/ws";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Application identifier cannot be empty")]
    EmptyAppId,
    #[error("Invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },
}

/// Where the client connects to.
#[derive(Debug)]
pub enum EndpointSource {
    /// Full URL, used verbatim.
    Override(String),
    /// Base URL plus an application identifier appended as a query parameter.
    App { base_url: String, app_id: SecretString },
}

impl EndpointSource {
    pub fn app(base_url: impl Into<String>, app_id: impl Into<String>) -> Self {
        EndpointSource::App {
            base_url: base_url.into(),
            app_id: SecretString::from(app_id.into()),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            EndpointSource::Override(endpoint) => {
                Url::parse(endpoint).map_err(|e| ConfigError::InvalidEndpoint {
                    endpoint: endpoint.clone(),
                    reason: e.to_string(),
                })?;
            }
            EndpointSource::App { base_url, app_id } => {
                if app_id.expose_secret().trim().is_empty() {
                    return Err(ConfigError::EmptyAppId);
                }
                Url::parse(base_url).map_err(|e| ConfigError::InvalidEndpoint {
                    endpoint: base_url.clone(),
                    reason: e.to_string(),
                })?;
            }
        }
        Ok(())
    }
}

/// Immutable connection and audio parameters for one client instance.
#[derive(Debug)]
pub struct ClientConfig {
    endpoint: EndpointSource,
    /// Keep-alive ping period for the transport
    pub ping_interval: Duration,
    /// Per-attempt connect timeout
    pub connect_timeout: Duration,
    audio_chunk_duration: Duration,
    audio_backlog_budget: Duration,
    /// Attempts made by a single explicit `connect()`
    pub connect_attempts: u32,
    /// Fixed delay between those attempts
    pub connect_retry_delay: Duration,
    /// Backoff attempts after an established connection is lost
    pub max_reconnect_attempts: u32,
    /// Upper bound on waiting for the server's `session_created`
    pub session_wait_timeout: Duration,
    /// Sent-chunk period between drop-rate checks
    pub drop_check_interval: u64,
    /// Drop rate above which a degraded-audio warning is emitted
    pub drop_warning_threshold: f64,
    /// Capture is stopped when the microphone delivers nothing for this long
    pub capture_stall_timeout: Duration,
    /// Idle poll of the send loop when the queue is empty
    pub send_poll_interval: Duration,
    pub level: LevelMeterConfig,
}

impl ClientConfig {
    /// Build a config with default tuning. Fails if the endpoint cannot be
    /// resolved, so a missing application identifier is caught here and not
    /// at connect time.
    pub fn new(endpoint: EndpointSource) -> Result<Self, ConfigError> {
        endpoint.validate()?;
        Ok(Self {
            endpoint,
            ping_interval: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(10),
            audio_chunk_duration: Duration::from_millis(20),
            audio_backlog_budget: Duration::from_millis(300),
            connect_attempts: 3,
            connect_retry_delay: Duration::from_millis(500),
            max_reconnect_attempts: 5,
            session_wait_timeout: Duration::from_secs(10),
            drop_check_interval: 100,
            drop_warning_threshold: 0.05,
            capture_stall_timeout: Duration::from_secs(2),
            send_poll_interval: Duration::from_millis(10),
            level: LevelMeterConfig::default(),
        })
    }

    /// Config pointing at a full endpoint URL.
    pub fn with_endpoint(endpoint: impl Into<String>) -> Result<Self, ConfigError> {
        Self::new(EndpointSource::Override(endpoint.into()))
    }

    /// Config pointing at a base URL with an application identifier.
    pub fn with_app_id(
        base_url: impl Into<String>,
        app_id: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        Self::new(EndpointSource::app(base_url, app_id))
    }

    /// Load configuration from the environment (and `.env` if present).
    ///
    /// `AGENT_ENDPOINT` wins over `AGENT_BASE_URL` + `AGENT_APP_ID`.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let endpoint = match env::var("AGENT_ENDPOINT") {
            Ok(endpoint) if !endpoint.trim().is_empty() => EndpointSource::Override(endpoint),
            _ => {
                let base_url =
                    env::var("AGENT_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
                let app_id = env::var("AGENT_APP_ID")
                    .map_err(|_| ConfigError::MissingEnvVar("AGENT_APP_ID".to_string()))?;
                EndpointSource::app(base_url, app_id)
            }
        };

        let mut config = Self::new(endpoint)?;
        if let Some(secs) = Self::env_u64("AGENT_PING_INTERVAL_SECS")? {
            config.ping_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = Self::env_u64("AGENT_CONNECT_TIMEOUT_SECS")? {
            config.connect_timeout = Duration::from_secs(secs);
        }

        let chunk = Self::env_u64("AGENT_AUDIO_CHUNK_MS")?
            .map(Duration::from_millis)
            .unwrap_or(config.audio_chunk_duration);
        let backlog = Self::env_u64("AGENT_AUDIO_BACKLOG_MS")?
            .map(Duration::from_millis)
            .unwrap_or(config.audio_backlog_budget);
        config.set_audio_timing(chunk, backlog)?;

        log::info!(
            "Loaded client configuration (chunk {:?}, backlog {:?})",
            config.audio_chunk_duration,
            config.audio_backlog_budget
        );
        Ok(config)
    }

    fn env_u64(name: &str) -> Result<Option<u64>, ConfigError> {
        match env::var(name) {
            Ok(raw) => raw
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|e| ConfigError::InvalidValue {
                    name: name.to_string(),
                    reason: e.to_string(),
                }),
            Err(_) => Ok(None),
        }
    }

    /// Set chunk duration and backlog budget together. The chunk must hold at
    /// least one sample; the budget is raised to one chunk if smaller.
    pub fn set_audio_timing(
        &mut self,
        chunk_duration: Duration,
        backlog_budget: Duration,
    ) -> Result<(), ConfigError> {
        if crate::audio::chunk_size_bytes(chunk_duration) == 0 {
            return Err(ConfigError::InvalidValue {
                name: "audio_chunk_duration".to_string(),
                reason: format!("{:?} is shorter than one sample", chunk_duration),
            });
        }
        self.audio_chunk_duration = chunk_duration;
        self.audio_backlog_budget = backlog_budget.max(chunk_duration);
        Ok(())
    }

    /// Builder form of [`set_audio_timing`](Self::set_audio_timing).
    pub fn audio_timing(
        mut self,
        chunk_duration: Duration,
        backlog_budget: Duration,
    ) -> Result<Self, ConfigError> {
        self.set_audio_timing(chunk_duration, backlog_budget)?;
        Ok(self)
    }

    pub fn audio_chunk_duration(&self) -> Duration {
        self.audio_chunk_duration
    }

    pub fn audio_backlog_budget(&self) -> Duration {
        self.audio_backlog_budget
    }

    /// Wire chunk size in bytes.
    pub fn chunk_bytes(&self) -> usize {
        crate::audio::chunk_size_bytes(self.audio_chunk_duration)
    }

    /// Maximum number of chunks the outbound queue may hold (at least one).
    pub fn backlog_chunks(&self) -> usize {
        let chunk = self.audio_chunk_duration.as_micros();
        let budget = self.audio_backlog_budget.as_micros();
        ((budget / chunk) as usize).max(1)
    }

    /// The URL to connect to. Contains the application identifier, so avoid
    /// logging it.
    pub fn endpoint(&self) -> String {
        match &self.endpoint {
            EndpointSource::Override(endpoint) => endpoint.clone(),
            EndpointSource::App { base_url, app_id } => match Url::parse(base_url) {
                Ok(mut url) => {
                    url.query_pairs_mut()
                        .append_pair(APP_ID_PARAM, app_id.expose_secret());
                    url.to_string()
                }
                // validated in `new`
                Err(_) => base_url.clone(),
            },
        }
    }
}

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ClientError;
use crate::storage::default_state_path;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";
pub const ENV_BASE_URL: &str = "GATEWAY_BASE_URL";
pub const ENV_RETRY_BACKOFF_MS: &str = "GATEWAY_RETRY_BACKOFF_MS";
pub const ENV_TIMEOUT_MS: &str = "GATEWAY_TIMEOUT_MS";
pub const ENV_STATE_PATH: &str = "GATEWAY_STATE_PATH";

pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_FRAME_INTERVAL_MS: u64 = 16;
pub const DEFAULT_REVEAL_DURATION_MS: u64 = 2_000;

/// Pacing of the simulated reveal used when a chat reply arrives whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub frame_interval: Duration,
    pub reveal_duration: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(DEFAULT_FRAME_INTERVAL_MS),
            reveal_duration: Duration::from_millis(DEFAULT_REVEAL_DURATION_MS),
        }
    }
}

impl StreamConfig {
    /// Number of frames a reveal is spread over; never zero.
    pub fn frame_count(&self) -> usize {
        let frame = self.frame_interval.as_micros().max(1);
        (self.reveal_duration.as_micros() / frame).max(1) as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub base_url: String,
    pub retry_backoff: Duration,
    pub request_timeout: Duration,
    pub stream: StreamConfig,
    /// Where the remembered session is kept. `None` keeps it in memory only.
    pub state_path: Option<PathBuf>,
}

impl GatewayConfig {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        Ok(Self {
            base_url: normalize_base_url(base_url)?,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            request_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            stream: StreamConfig::default(),
            state_path: None,
        })
    }

    /// Reads `GATEWAY_*` variables, falling back to a local gateway and the
    /// platform data directory.
    pub fn from_env() -> Result<Self, ClientError> {
        let (base_url, source) = resolve_base_url()?;
        tracing::debug!(base_url = %base_url, source, "resolved gateway base url");
        let mut config = Self::new(&base_url)?;
        config.retry_backoff = env_millis(ENV_RETRY_BACKOFF_MS, DEFAULT_RETRY_BACKOFF_MS);
        config.request_timeout = env_millis(ENV_TIMEOUT_MS, DEFAULT_TIMEOUT_MS);
        config.state_path = Some(
            env_non_empty(ENV_STATE_PATH)
                .map(PathBuf::from)
                .unwrap_or_else(default_state_path),
        );
        Ok(config)
    }

    pub fn with_retry_backoff(mut self, retry_backoff: Duration) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn with_stream(mut self, stream: StreamConfig) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = Some(path.into());
        self
    }
}

pub fn resolve_base_url() -> Result<(String, &'static str), ClientError> {
    if let Some(base_url) = env_non_empty(ENV_BASE_URL) {
        return normalize_base_url(&base_url).map(|normalized| (normalized, ENV_BASE_URL));
    }
    normalize_base_url(DEFAULT_BASE_URL).map(|normalized| (normalized, "default_local"))
}

pub fn normalize_base_url(raw: &str) -> Result<String, ClientError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ClientError::BaseUrlMissing);
    }
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(ClientError::InvalidBaseUrl);
    }
    let Some((_, remainder)) = trimmed.split_once("://") else {
        return Err(ClientError::InvalidBaseUrl);
    };
    if remainder.trim().is_empty() || remainder.starts_with('/') {
        return Err(ClientError::InvalidBaseUrl);
    }
    Ok(trimmed.to_string())
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_millis(key: &str, default_ms: u64) -> Duration {
    let Some(raw) = env_non_empty(key) else {
        return Duration::from_millis(default_ms);
    };
    match raw.parse::<u64>() {
        Ok(millis) => Duration::from_millis(millis),
        Err(error) => {
            tracing::warn!(key, value = %raw, error = %error, "ignoring invalid duration");
            Duration::from_millis(default_ms)
        }
    }
}

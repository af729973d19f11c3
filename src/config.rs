//! Session configuration loading.
//!
//! A [`SessionConfig`] is passed explicitly to [`Session::open`](crate::rtu::Session::open);
//! nothing in the crate reads ambient global state. Values come from
//! defaults, an optional JSON file, and `NOTEBOOK_SYNC_*` environment
//! variables, in that order of precedence (later wins).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::constants;

/// Reconnect backoff schedule.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct BackoffConfig {
    /// First delay in milliseconds.
    pub initial_ms: u64,
    /// Cap on any single delay in milliseconds.
    pub max_ms: u64,
    /// Maximum random jitter added per delay in milliseconds.
    pub jitter_ms: u64,
    /// Consecutive failed attempts before the session fails terminally.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: constants::INITIAL_BACKOFF_MS,
            max_ms: constants::MAX_BACKOFF_MS,
            jitter_ms: constants::BACKOFF_JITTER_MS,
            max_attempts: constants::MAX_RECONNECT_ATTEMPTS,
        }
    }
}

/// Configuration for one realtime session.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct SessionConfig {
    /// Base URL of the REST API (snapshot fetches, default realtime endpoint).
    pub api_url: String,
    /// Explicit realtime endpoint. Derived from `api_url` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtu_url: Option<String>,
    /// Document (file) to open.
    pub file_id: String,
    /// Bearer credential - NOT serialized to disk.
    #[serde(skip)]
    pub token: String,
    /// Client type reported during authentication.
    pub client_type: String,
    /// Default per-request deadline in milliseconds.
    pub request_timeout_ms: u64,
    /// Deadline for each handshake phase in milliseconds.
    pub handshake_timeout_ms: u64,
    /// Heartbeat interval in milliseconds.
    pub ping_interval_ms: u64,
    /// Inbound silence that counts as a dead connection, in milliseconds.
    pub stale_timeout_ms: u64,
    /// Also subscribe to the kernel status channel of the document.
    pub subscribe_kernel_channel: bool,
    /// Reconnect schedule.
    pub backoff: BackoffConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_url: constants::DEFAULT_API_URL.to_string(),
            rtu_url: None,
            file_id: String::new(),
            token: String::new(),
            client_type: constants::DEFAULT_CLIENT_TYPE.to_string(),
            request_timeout_ms: millis(constants::REQUEST_TIMEOUT),
            handshake_timeout_ms: millis(constants::HANDSHAKE_TIMEOUT),
            ping_interval_ms: millis(constants::PING_INTERVAL),
            stale_timeout_ms: millis(constants::STALE_CONNECTION_TIMEOUT),
            subscribe_kernel_channel: true,
            backoff: BackoffConfig::default(),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl SessionConfig {
    /// Config for `file_id` with `token`, everything else defaulted.
    pub fn new(api_url: impl Into<String>, file_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            file_id: file_id.into(),
            token: token.into(),
            ..Self::default()
        }
    }

    /// Loads configuration from an optional file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Reads a JSON config file. Missing fields fall back to defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Applies `NOTEBOOK_SYNC_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from an arbitrary key lookup.
    ///
    /// Unparseable numeric values are logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(api_url) = lookup("NOTEBOOK_SYNC_API_URL") {
            self.api_url = api_url;
        }
        if let Some(rtu_url) = lookup("NOTEBOOK_SYNC_RTU_URL") {
            self.rtu_url = Some(rtu_url);
        }
        if let Some(file_id) = lookup("NOTEBOOK_SYNC_FILE_ID") {
            self.file_id = file_id;
        }

        // Token from env var (for CI/CD)
        if let Some(token) = lookup("NOTEBOOK_SYNC_TOKEN") {
            self.token = token;
        }

        if let Some(value) = parse_override(&lookup, "NOTEBOOK_SYNC_REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = value;
        }
        if let Some(value) = parse_override(&lookup, "NOTEBOOK_SYNC_PING_INTERVAL_MS") {
            self.ping_interval_ms = value;
        }
        if let Some(value) = parse_override(&lookup, "NOTEBOOK_SYNC_MAX_BACKOFF_MS") {
            self.backoff.max_ms = value;
        }
        if let Some(value) = parse_override(&lookup, "NOTEBOOK_SYNC_MAX_RECONNECT_ATTEMPTS") {
            self.backoff.max_attempts = value;
        }
    }

    /// Checks the fields a session cannot open without.
    pub fn validate(&self) -> Result<()> {
        if self.file_id.trim().is_empty() {
            anyhow::bail!("file_id is required");
        }
        if self.token.is_empty() {
            anyhow::bail!("token is required");
        }
        if self.ping_interval_ms == 0 {
            anyhow::bail!("ping_interval_ms must be positive");
        }
        if self.stale_timeout_ms <= self.ping_interval_ms {
            log::warn!(
                "[Config] stale_timeout_ms ({}) does not exceed ping_interval_ms ({}); idle connections will be recycled",
                self.stale_timeout_ms,
                self.ping_interval_ms
            );
        }
        if self.backoff.initial_ms > self.backoff.max_ms {
            anyhow::bail!(
                "backoff.initial_ms ({}) exceeds backoff.max_ms ({})",
                self.backoff.initial_ms,
                self.backoff.max_ms
            );
        }
        Ok(())
    }

    /// Realtime endpoint: the explicit override, else `{api_url}/v1/rtu` on a ws scheme.
    pub fn rtu_endpoint(&self) -> String {
        match &self.rtu_url {
            Some(url) => crate::ws::http_to_ws_scheme(url),
            None => format!(
                "{}/v1/rtu",
                crate::ws::http_to_ws_scheme(self.api_url.trim_end_matches('/'))
            ),
        }
    }

    /// Default per-request deadline.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Deadline for each handshake phase.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Heartbeat interval.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Inbound silence tolerated before reconnecting.
    pub fn stale_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_timeout_ms)
    }
}

fn parse_override<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("[Config] Ignoring unparseable {}={:?}", key, raw);
            None
        }
    }
}

//! Configuration for the venue client and the runner.
//!
//! The runner reads a single JSON file. The top-level structure carries
//! logging metadata and one `client` block describing the venue connection.
//!
//! # Example config
//!
//! ```json
//! {
//!   "app": { "module_name": "venue_link", "log_path": "/tmp/log" },
//!   "client": {
//!     "address": "127.0.0.1:9100",
//!     "name": "desk-1",
//!     "token": "3f1c...",
//!     "subscribe": ["quotes", "notify"],
//!     "channel_prefix": "venue.",
//!     "reconnect": { "delay_ms": 5000 }
//!   }
//! }
//! ```
//!
//! All duration fields are in milliseconds.

use std::time::Duration;

use serde::Deserialize;

use crate::error::ClientError;

/// Top-level runner config, deserialized from a JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    /// Module metadata (name, log path).
    pub app: Option<ModuleMeta>,

    /// Venue connection settings.
    pub client: ClientConfig,
}

impl RunnerConfig {
    /// Returns the module name, falling back to the client name.
    pub fn module_name(&self) -> String {
        self.app.as_ref().and_then(|m| m.module_name.clone()).unwrap_or_else(|| self.client.name.clone())
    }

    /// Returns the log path.
    pub fn log_path(&self) -> Option<String> {
        self.app.as_ref().and_then(|m| m.log_path.clone())
    }
}

/// Module metadata block.
#[derive(Debug, Clone, Deserialize)]
pub struct ModuleMeta {
    pub module_name: Option<String>,
    pub log_path: Option<String>,
}

/// Construction-time settings for one venue client.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// `host:port` of the venue endpoint.
    pub address: String,

    /// Client name, used as the log label.
    #[serde(default = "default_name")]
    pub name: String,

    /// Pre-obtained session token, stamped on every outbound request as `__token`.
    #[serde(default)]
    pub token: String,

    /// Channels to subscribe automatically after each connect.
    #[serde(default)]
    pub subscribe: Vec<String>,

    /// When set, no output channel is ever invoked.
    #[serde(default)]
    pub ignore_events: bool,

    /// Prefix applied to every output channel name.
    #[serde(default)]
    pub channel_prefix: String,

    /// Time allowed for a response before the request fails.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Delay between entering Connected and sending the auto-subscribe request.
    #[serde(default = "default_subscribe_settle_ms")]
    pub subscribe_settle_ms: u64,

    /// Reconnect timing.
    #[serde(default)]
    pub reconnect: ReconnectPolicy,

    /// Optional upper bound on notification tokens remembered per epoch.
    ///
    /// `None` keeps every token until the next reconnect.
    #[serde(default)]
    pub dedup_capacity: Option<usize>,
}

impl ClientConfig {
    /// Config with defaults for everything except the address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: default_name(),
            token: String::new(),
            subscribe: Vec::new(),
            ignore_events: false,
            channel_prefix: String::new(),
            request_timeout_ms: default_request_timeout_ms(),
            subscribe_settle_ms: default_subscribe_settle_ms(),
            reconnect: ReconnectPolicy::default(),
            dedup_capacity: None,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn subscribe_settle(&self) -> Duration {
        Duration::from_millis(self.subscribe_settle_ms)
    }

    /// Reject settings the client cannot run with.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.address.trim().is_empty() {
            return Err(ClientError::Config("address is empty".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(ClientError::Config("request_timeout_ms must be > 0".into()));
        }
        if self.reconnect.backoff_factor < 1.0 {
            return Err(ClientError::Config("reconnect.backoff_factor must be >= 1.0".into()));
        }
        if self.dedup_capacity == Some(0) {
            return Err(ClientError::Config("dedup_capacity must be > 0 when set".into()));
        }
        Ok(())
    }
}

/// Reconnect timing.
///
/// The default is a fixed interval retried forever: `backoff_factor = 1.0`
/// and no attempt limit.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt.
    #[serde(default = "default_reconnect_delay_ms")]
    pub delay_ms: u64,

    /// Multiplier applied to the delay after each consecutive failure.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Upper bound on the delay once backoff is applied.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Give up after this many consecutive failed attempts.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    /// Fixed-interval policy with no retry limit.
    pub fn fixed(delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self { delay_ms: ms, backoff_factor: 1.0, max_delay_ms: ms, max_attempts: None }
    }

    /// Delay to wait after `failures` consecutive failed epochs (0 = first).
    pub fn delay_for(&self, failures: u32) -> Duration {
        let base = self.delay_ms as f64;
        let scaled = base * self.backoff_factor.powi(failures.min(32) as i32);
        let capped = scaled.min(self.max_delay_ms.max(self.delay_ms) as f64);
        Duration::from_millis(capped as u64)
    }

    /// Whether another attempt is allowed after `failures` consecutive failures.
    pub fn allows(&self, failures: u32) -> bool {
        self.max_attempts.is_none_or(|max| failures < max)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay_ms: default_reconnect_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Default helpers (used by serde)
// ---------------------------------------------------------------------------

fn default_name() -> String {
    "venue".into()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_subscribe_settle_ms() -> u64 {
    500
}

fn default_reconnect_delay_ms() -> u64 {
    5_000
}

fn default_backoff_factor() -> f64 {
    1.0
}

fn default_max_delay_ms() -> u64 {
    5_000
}

/// Load and parse a JSON config file.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<RunnerConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: RunnerConfig = serde_json::from_str(&content)?;
    config.client.validate()?;
    Ok(config)
}

//! Limiter configuration.
//!
//! Every option except the idle hook can be loaded from JSON:
//!
//! ```json
//! { "name": "compute", "rate_window_ms": 1000, "max_rate": 10, "max_concurrency": 20 }
//! ```
//!
//! A missing, `null` or zero `max_rate`/`max_concurrency` disables that limit.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_RATE_WINDOW_MS: u64 = 1000;
pub const DEFAULT_IDLE_MS: u64 = 5000;

/// Callback invoked when the limiter has had nothing outstanding for `idle_ms`.
///
/// Runs on the coordinator task, so it must not block.
pub type IdleHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read limiter config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid limiter config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    pub name: String,
    #[serde(default = "default_rate_window_ms")]
    pub rate_window_ms: u64,
    #[serde(default)]
    pub max_rate: Option<usize>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    #[serde(default = "default_idle_ms")]
    pub idle_ms: u64,
    #[serde(skip)]
    pub on_idle: Option<IdleHook>,
}

fn default_rate_window_ms() -> u64 {
    DEFAULT_RATE_WINDOW_MS
}

fn default_idle_ms() -> u64 {
    DEFAULT_IDLE_MS
}

impl std::fmt::Debug for LimiterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterConfig")
            .field("name", &self.name)
            .field("rate_window_ms", &self.rate_window_ms)
            .field("max_rate", &self.max_rate)
            .field("max_concurrency", &self.max_concurrency)
            .field("idle_ms", &self.idle_ms)
            .field("on_idle", &self.on_idle.is_some())
            .finish()
    }
}

impl LimiterConfig {
    /// Unlimited on both dimensions until limits are set.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rate_window_ms: DEFAULT_RATE_WINDOW_MS,
            max_rate: None,
            max_concurrency: None,
            idle_ms: DEFAULT_IDLE_MS,
            on_idle: None,
        }
    }

    /// Budget used in front of the external compute backend: 10 requests per
    /// second with at most 20 in flight.
    pub fn compute_gateway() -> Self {
        Self::new("compute-gateway")
            .with_rate_window(Duration::from_millis(1000))
            .with_max_rate(10)
            .with_max_concurrency(20)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn with_rate_window(mut self, window: Duration) -> Self {
        self.rate_window_ms = window.as_millis() as u64;
        self
    }

    pub fn with_max_rate(mut self, max_rate: usize) -> Self {
        self.max_rate = Some(max_rate);
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }

    pub fn with_idle(mut self, idle: Duration) -> Self {
        self.idle_ms = idle.as_millis() as u64;
        self
    }

    pub fn with_on_idle(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_idle = Some(Arc::new(hook));
        self
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }

    /// Effective rate pool size, `None` when rate limiting is off.
    pub fn rate_limit(&self) -> Option<usize> {
        self.max_rate.filter(|&n| n > 0)
    }

    /// Effective concurrency pool size, `None` when concurrency limiting is off.
    pub fn concurrency_limit(&self) -> Option<usize> {
        self.max_concurrency.filter(|&n| n > 0)
    }
}

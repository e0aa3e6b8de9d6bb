//! Engine configuration.
//!
//! Precedence: builder (CLI flag) > environment variable > default.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::sync::{
    BackoffPolicy, ConflictStrategy, FlushConfig, MonitorConfig, RealtimeConfig, get_db_path,
};

pub const ENV_SERVER_URL: &str = "MSYNC_SERVER_URL";
pub const ENV_WS_URL: &str = "MSYNC_WS_URL";
pub const ENV_DB: &str = "MSYNC_DB";
pub const ENV_CONFLICT_STRATEGY: &str = "MSYNC_CONFLICT_STRATEGY";

const DEFAULT_SERVER_URL: &str = "http://localhost:3737";

/// Sync engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the maintenance server
    pub server_url: String,
    /// Realtime endpoint; derived from `server_url` when unset
    pub ws_url: Option<String>,
    /// Queue database file
    pub db_path: PathBuf,
    pub conflict_strategy: ConflictStrategy,
    pub monitor: MonitorConfig,
    pub realtime: RealtimeConfig,
    pub flush: FlushConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            ws_url: None,
            db_path: get_db_path(),
            conflict_strategy: ConflictStrategy::default(),
            monitor: MonitorConfig::default(),
            realtime: RealtimeConfig::default(),
            flush: FlushConfig::default(),
        }
    }
}

impl Config {
    /// Defaults overlaid with `MSYNC_*` environment variables.
    pub fn new() -> Self {
        let mut config = Self::default();

        if let Some(url) = env_non_empty(ENV_SERVER_URL) {
            config.server_url = url;
        }
        if let Some(url) = env_non_empty(ENV_WS_URL) {
            config.ws_url = Some(url);
        }
        if let Some(path) = env_non_empty(ENV_DB) {
            config.db_path = PathBuf::from(path);
        }
        if let Some(value) = env_non_empty(ENV_CONFLICT_STRATEGY) {
            match value.parse() {
                Ok(strategy) => config.conflict_strategy = strategy,
                Err(e) => warn!(var = ENV_CONFLICT_STRATEGY, error = %e, "Ignoring invalid value"),
            }
        }

        config
    }

    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into();
        self
    }

    pub fn with_ws_url(mut self, url: impl Into<String>) -> Self {
        self.ws_url = Some(url.into());
        self
    }

    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = path.into();
        self
    }

    pub fn with_conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = strategy;
        self
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.monitor.probe_interval = interval;
        self
    }

    pub fn with_hint_interval(mut self, interval: Duration) -> Self {
        self.monitor.hint_interval = interval;
        self
    }

    /// Bound for liveness probes and for every flush request.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.monitor.probe_timeout = timeout;
        self.flush.request_timeout = timeout;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.realtime.heartbeat_interval = interval;
        self.realtime.heartbeat_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, policy: BackoffPolicy) -> Self {
        self.realtime.reconnect = policy;
        self
    }

    pub fn with_item_retry(mut self, policy: BackoffPolicy) -> Self {
        self.flush.item_retry = policy;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.flush.batch_size = size.max(1);
        self
    }

    /// The realtime endpoint: `ws_url`, or `server_url` with a ws scheme and `/ws`.
    pub fn realtime_url(&self) -> String {
        if let Some(url) = &self.ws_url {
            return url.clone();
        }
        let base = self.server_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        format!("{}/ws", base)
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

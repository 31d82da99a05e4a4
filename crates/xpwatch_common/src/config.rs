//! Configuration for xpwatchd.
//!
//! Loads settings from a TOML file (default `/etc/xpwatch/config.toml`,
//! overridable via `XPWATCH_CONFIG`) or falls back to defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Default config file path.
pub const CONFIG_PATH: &str = "/etc/xpwatch/config.toml";

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Base URL of the read-only character API; the character id is appended.
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Webhook URL notifications are delivered to. Resolved once at startup;
    /// an unreachable webhook is fatal to the reconciliation loop.
    #[serde(default)]
    pub webhook_url: String,

    /// Delay between reconciliation passes, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Total lifetime of one precise-tracker session, in seconds.
    #[serde(default = "default_tracker_duration_secs")]
    pub tracker_duration_secs: u64,

    /// Delay between precise-tracker probes, in milliseconds.
    #[serde(default = "default_tracker_tick_ms")]
    pub tracker_tick_ms: u64,

    /// Per-request timeout for character fetches, in seconds.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    /// Cached subject state file.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Watchlist file (id -> subscriber ids).
    #[serde(default = "default_watch_file")]
    pub watch_file: PathBuf,

    /// Bind address for the local command API.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_api_base() -> String {
    "https://bubble-portal.com/api/characters/Thana".to_string()
}

fn default_poll_interval_ms() -> u64 {
    3_500
}

fn default_tracker_duration_secs() -> u64 {
    600
}

fn default_tracker_tick_ms() -> u64 {
    2_000
}

fn default_fetch_timeout_secs() -> u64 {
    8
}

fn default_state_file() -> PathBuf {
    PathBuf::from("/var/lib/xpwatch/xp_state.json")
}

fn default_watch_file() -> PathBuf {
    PathBuf::from("/var/lib/xpwatch/xp_targets.json")
}

fn default_bind_addr() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            webhook_url: String::new(),
            poll_interval_ms: default_poll_interval_ms(),
            tracker_duration_secs: default_tracker_duration_secs(),
            tracker_tick_ms: default_tracker_tick_ms(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            state_file: default_state_file(),
            watch_file: default_watch_file(),
            bind_addr: default_bind_addr(),
        }
    }
}

impl WatchConfig {
    /// Load configuration, falling back to defaults if the file is missing
    /// or malformed.
    pub fn load() -> Self {
        let path = std::env::var("XPWATCH_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(CONFIG_PATH));
        Self::load_from(&path)
    }

    /// Load configuration from an explicit path.
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            warn!("Config file {} not found, using defaults", path.display());
            return Self::default();
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    warn!("Failed to parse {}: {}, using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Failed to read {}: {}, using defaults", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn tracker_duration(&self) -> Duration {
        Duration::from_secs(self.tracker_duration_secs)
    }

    pub fn tracker_tick(&self) -> Duration {
        Duration::from_millis(self.tracker_tick_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

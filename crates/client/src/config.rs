// Local configuration for the sync client.
//
// Global config: `~/.feedsync/config.toml`
// Durable cache: `~/.feedsync/cache.db` unless overridden.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Root directory for feedsync local state: `~/.feedsync/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".feedsync"))
}

/// Path to the global config file: `~/.feedsync/config.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("config.toml"))
}

/// Default location of the durable cache database.
pub fn default_cache_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("cache.db"))
}

// ── Client config ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ClientConfig {
    pub realtime: RealtimeConfig,
    pub cache: CacheConfig,
}

impl ClientConfig {
    /// Load from `~/.feedsync/config.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        global_config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Cache database path: the configured one, else the default under home.
    pub fn cache_path(&self) -> Option<PathBuf> {
        self.cache.path.clone().or_else(default_cache_path)
    }
}

/// Push channel endpoint and reconnection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Host with optional port, e.g. `localhost:8000` or `api.example.com`.
    pub host: String,
    /// Path of the notification socket, e.g. `/ws/notifications/`.
    pub path: String,
    /// Force `wss` (true) or `ws` (false). Unset picks `ws` for loopback
    /// hosts and `wss` for everything else.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secure: Option<bool>,
    pub reconnect: ReconnectConfig,
    /// Conversation polling interval while the channel is down. 0 disables.
    pub fallback_poll_ms: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            host: "localhost:8000".into(),
            path: "/ws/notifications/".into(),
            secure: None,
            reconnect: ReconnectConfig::default(),
            fallback_poll_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self { base_delay_ms: 1_000, max_delay_ms: 10_000, max_attempts: 5 }
    }
}

impl RealtimeConfig {
    pub fn fallback_poll_interval(&self) -> Option<Duration> {
        (self.fallback_poll_ms > 0).then(|| Duration::from_millis(self.fallback_poll_ms))
    }
}

impl ReconnectConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub max_notifications: usize,
    pub max_viewed_stories: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { path: None, max_notifications: 200, max_viewed_stories: 1_000 }
    }
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

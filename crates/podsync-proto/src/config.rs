use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::platform;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub startup: StartupConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Base of the REST API; `/sys/config` and `/notifications/unread` hang
    /// off it.
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsConfig {
    /// Toasts visible at once; the oldest goes first when exceeded.
    #[serde(default = "default_max_visible")]
    pub max_visible: usize,
    #[serde(default = "default_success_secs")]
    pub success_secs: u64,
    #[serde(default = "default_info_secs")]
    pub info_secs: u64,
}

/// Reconnection after the push connection drops. Off by default: a dead
/// connection then stays down until the server config changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_reconnect_initial_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub max_delay_ms: u64,
}

/// Retry policy for the one-shot startup fetches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartupConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
        }
    }
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            max_visible: default_max_visible(),
            success_secs: default_success_secs(),
            info_secs: default_info_secs(),
        }
    }
}

impl NotificationsConfig {
    pub fn success_duration(&self) -> Duration {
        Duration::from_secs(self.success_secs)
    }

    pub fn info_duration(&self) -> Duration {
        Duration::from_secs(self.info_secs)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_delay_ms: default_reconnect_initial_ms(),
            max_delay_ms: default_reconnect_max_ms(),
        }
    }
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_api_url() -> String {
    "http://localhost:8000/api/v1".to_string()
}

fn default_max_visible() -> usize {
    4
}

fn default_success_secs() -> u64 {
    3
}

fn default_info_secs() -> u64 {
    3
}

fn default_reconnect_initial_ms() -> u64 {
    1_000
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    8_000
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_log_filter() -> String {
    "info,podsync=debug,podsync_client=debug,podsync_proto=debug,hyper=warn,reqwest=warn,tungstenite=warn"
        .to_string()
}

impl ClientConfig {
    /// Load from the default location, writing defaults there on first run.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(config_path: &Path) -> anyhow::Result<Self> {
        if !config_path.exists() {
            let config = Self::default();
            config.save_to(config_path)?;
            tracing::info!("wrote default config to {}", config_path.display());
            return Ok(config);
        }

        let content = std::fs::read_to_string(config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to(&self, config_path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

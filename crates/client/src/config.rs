// Client configuration: `~/.tandem/config.toml`, then environment overrides.

use std::env::VarError;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::coalescer::{WindowConfig, DEFAULT_LOCAL_WINDOW_MS, DEFAULT_REMOTE_WINDOW_MS};
use crate::engine::presence::DisplayMode;
use crate::engine::remote_apply::DEFAULT_MAX_REQUEUE;
use crate::engine::session::{Identity, SessionConfig};

pub const DEFAULT_RELAY_URL: &str = "ws://localhost:8080";
pub const DEFAULT_PROJECT: &str = "default_project";
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 10_000;

/// Root directory for Tandem client state: `~/.tandem/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".tandem"))
}

/// Path to the client config file: `~/.tandem/config.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("config.toml"))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Relay WebSocket URL.
    pub relay_url: String,
    /// Room to join.
    pub project: String,
    /// How peers are labelled.
    pub display_mode: DisplayMode,
    pub identity: IdentityConfig,
    pub sync: SyncConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.into(),
            project: DEFAULT_PROJECT.into(),
            display_mode: DisplayMode::default(),
            identity: IdentityConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

/// Unset fields are generated per process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct IdentityConfig {
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub user_display_name: Option<String>,
}

/// Buffering and reconnect timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
    /// Local keystroke coalescing window.
    pub local_window_ms: u64,
    /// Remote operation buffering window.
    pub remote_window_ms: u64,
    /// Attempts before an inapplicable remote operation is dropped.
    pub max_requeue: u32,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            local_window_ms: DEFAULT_LOCAL_WINDOW_MS,
            remote_window_ms: DEFAULT_REMOTE_WINDOW_MS,
            max_requeue: DEFAULT_MAX_REQUEUE,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
        }
    }
}

impl ClientConfig {
    /// Load `~/.tandem/config.toml` and apply environment overrides. A
    /// missing or unreadable file yields defaults.
    pub fn load() -> Self {
        let mut config =
            global_config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default();
        config.apply_env_fn(|key| std::env::var(key));
        config
    }

    /// Load from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, contents).map_err(ConfigError::Io)
    }

    /// Apply `TANDEM_*` overrides from the given variable lookup.
    pub fn apply_env_fn<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Result<String, VarError>,
    {
        let var = |key: &str| lookup(key).ok().filter(|value| !value.trim().is_empty());

        if let Some(url) = var("TANDEM_RELAY_URL") {
            self.relay_url = url;
        }
        if let Some(project) = var("TANDEM_PROJECT") {
            self.project = project;
        }
        if let Some(user_id) = var("TANDEM_USER_ID") {
            self.identity.user_id = Some(user_id);
        }
        if let Some(user_name) = var("TANDEM_USER_NAME") {
            self.identity.user_name = Some(user_name);
        }
        if let Some(display_name) = var("TANDEM_USER_DISPLAY_NAME") {
            self.identity.user_display_name = Some(display_name);
        }
    }

    /// The identity to join with, generating whatever is not configured.
    pub fn identity(&self) -> Identity {
        let generate = |prefix: &str| format!("{prefix}_{}", Uuid::new_v4());
        Identity {
            user_id: self.identity.user_id.clone().unwrap_or_else(|| generate("userId")),
            user_name: self.identity.user_name.clone().unwrap_or_else(|| generate("userName")),
            user_display_name: self
                .identity
                .user_display_name
                .clone()
                .unwrap_or_else(|| generate("userDisplayName")),
            project: self.project.clone(),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            local_window: WindowConfig::with_millis(self.sync.local_window_ms),
            remote_window: WindowConfig::with_millis(self.sync.remote_window_ms),
            max_requeue: self.sync.max_requeue,
            display_mode: self.display_mode,
        }
    }

    pub fn reconnect_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.sync.reconnect_delay_ms)
    }
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config I/O error: {e}"),
            Self::Parse(e) => write!(f, "config parse error: {e}"),
            Self::Serialize(e) => write!(f, "config serialize error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

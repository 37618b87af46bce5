//! Application configuration for QuestionTree.
//!
//! User config lives at `~/.questiontree/questiontree.toml`.
//! Environment variables override config file values, and CLI flags override
//! both. The engine never reads process state itself: callers resolve an
//! [`EngineConfig`] once and pass it into every entry point.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{QuestionTreeError, Result};
use crate::types::Device;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "questiontree.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".questiontree";

/// Default database file name inside the config directory.
const DATABASE_FILE_NAME: &str = "questiontree.db";

/// Environment variable holding a comma-separated proxy pool.
pub const ENV_PROXY_POOL: &str = "QT_PROXY_POOL";
/// Environment variable overriding the per-run node budget.
pub const ENV_MAX_NODES: &str = "QT_MAX_NODES";
/// Environment variable overriding the per-run time budget.
pub const ENV_MAX_RUNTIME_MS: &str = "QT_MAX_RUNTIME_MS";
/// Environment variable overriding the default device class.
pub const ENV_DEFAULT_DEVICE: &str = "QT_DEFAULT_DEVICE";

// ---------------------------------------------------------------------------
// Config structs (matching questiontree.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Extraction engine settings.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Tracking database settings.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// `[engine]` section, also the runtime configuration handed to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Outbound proxy endpoints. Empty means a direct connection.
    #[serde(default)]
    pub proxy_pool: Vec<String>,

    /// Maximum distinct questions recorded per run.
    #[serde(default = "default_max_nodes")]
    pub max_nodes: usize,

    /// Wall-clock budget for one run, in milliseconds.
    #[serde(default = "default_max_runtime_ms")]
    pub max_runtime_ms: u64,

    /// Device class used when a request does not name one.
    #[serde(default)]
    pub default_device: Device,

    /// Interval between child-injection polls after a click.
    #[serde(default = "default_child_poll_interval_ms")]
    pub child_poll_interval_ms: u64,

    /// How long to wait for children to appear after a click.
    #[serde(default = "default_child_poll_timeout_ms")]
    pub child_poll_timeout_ms: u64,

    /// Hard timeout for the initial navigation.
    #[serde(default = "default_navigation_timeout_ms")]
    pub navigation_timeout_ms: u64,

    /// Best-effort network-idle wait; allowed to expire silently.
    #[serde(default = "default_network_idle_timeout_ms")]
    pub network_idle_timeout_ms: u64,

    /// Consensus runs allowed in flight at once (1 = sequential).
    #[serde(default = "default_consensus_parallelism")]
    pub consensus_parallelism: usize,

    /// Results page the query composer targets.
    #[serde(default = "default_search_base_url")]
    pub search_base_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            proxy_pool: Vec::new(),
            max_nodes: default_max_nodes(),
            max_runtime_ms: default_max_runtime_ms(),
            default_device: Device::default(),
            child_poll_interval_ms: default_child_poll_interval_ms(),
            child_poll_timeout_ms: default_child_poll_timeout_ms(),
            navigation_timeout_ms: default_navigation_timeout_ms(),
            network_idle_timeout_ms: default_network_idle_timeout_ms(),
            consensus_parallelism: default_consensus_parallelism(),
            search_base_url: default_search_base_url(),
        }
    }
}

impl EngineConfig {
    pub fn max_runtime(&self) -> Duration {
        Duration::from_millis(self.max_runtime_ms)
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }

    pub fn network_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.network_idle_timeout_ms)
    }

    pub fn child_poll_interval(&self) -> Duration {
        Duration::from_millis(self.child_poll_interval_ms)
    }

    pub fn child_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.child_poll_timeout_ms)
    }

    /// Apply `QT_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `QT_*` overrides from an arbitrary lookup (testable form).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(pool) = lookup(ENV_PROXY_POOL) {
            self.proxy_pool = parse_proxy_pool(&pool);
        }
        if let Some(raw) = lookup(ENV_MAX_NODES) {
            self.max_nodes = raw.trim().parse().map_err(|e| {
                QuestionTreeError::config(format!("{ENV_MAX_NODES}='{raw}': {e}"))
            })?;
        }
        if let Some(raw) = lookup(ENV_MAX_RUNTIME_MS) {
            self.max_runtime_ms = raw.trim().parse().map_err(|e| {
                QuestionTreeError::config(format!("{ENV_MAX_RUNTIME_MS}='{raw}': {e}"))
            })?;
        }
        if let Some(raw) = lookup(ENV_DEFAULT_DEVICE) {
            self.default_device = raw
                .parse()
                .map_err(|e| QuestionTreeError::config(format!("{ENV_DEFAULT_DEVICE}: {e}")))?;
        }
        Ok(())
    }

    /// Reject values that would make a run unbounded or meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.max_nodes == 0 {
            return Err(QuestionTreeError::config("max_nodes must be at least 1"));
        }
        if self.max_runtime_ms == 0 {
            return Err(QuestionTreeError::config("max_runtime_ms must be positive"));
        }
        if self.child_poll_interval_ms == 0 {
            return Err(QuestionTreeError::config(
                "child_poll_interval_ms must be positive",
            ));
        }
        if self.consensus_parallelism == 0 {
            return Err(QuestionTreeError::config(
                "consensus_parallelism must be at least 1",
            ));
        }
        Ok(())
    }
}

fn default_max_nodes() -> usize {
    220
}
fn default_max_runtime_ms() -> u64 {
    45_000
}
fn default_child_poll_interval_ms() -> u64 {
    150
}
fn default_child_poll_timeout_ms() -> u64 {
    5_000
}
fn default_navigation_timeout_ms() -> u64 {
    30_000
}
fn default_network_idle_timeout_ms() -> u64 {
    4_000
}
fn default_consensus_parallelism() -> usize {
    1
}
fn default_search_base_url() -> String {
    "https://www.google.com/search".into()
}

/// `[storage]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the tracking database. Defaults to `~/.questiontree/questiontree.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<String>,
}

impl StorageConfig {
    /// Resolve the database path, falling back to the config directory.
    pub fn resolve_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(p) => Ok(PathBuf::from(p)),
            None => Ok(config_dir()?.join(DATABASE_FILE_NAME)),
        }
    }
}

/// Split a comma-separated proxy list, dropping blanks.
pub fn parse_proxy_pool(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.questiontree/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| QuestionTreeError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.questiontree/questiontree.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk, then apply environment overrides.
/// Returns defaults (plus overrides) if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    let mut config = if path.exists() {
        load_config_from(&path)?
    } else {
        tracing::debug!(?path, "config file not found, using defaults");
        AppConfig::default()
    };

    config.engine.apply_env()?;
    config.engine.validate()?;
    Ok(config)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| QuestionTreeError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        QuestionTreeError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| QuestionTreeError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| QuestionTreeError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| QuestionTreeError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

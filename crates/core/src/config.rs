use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Directory name under the user config dir when no root is given.
pub const APP_NAME: &str = "db_connector";

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_opt(key).and_then(|v| v.parse().ok())
}

// ── Top-level settings ────────────────────────────────────────

/// Runtime settings for the vault, adapters and registry.
///
/// Resolution order: defaults → `<root>/settings.toml` → `DBCONN_*` env vars.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Configuration root holding the connection file, key and logs.
    pub config_dir: PathBuf,
    pub pool: PoolSettings,
    /// Bound applied to `open`, `test` and `execute_*`.
    pub operation_timeout_secs: u64,
    /// Number of `connections.toml.backup.*` files kept after each save.
    pub max_backups: usize,
    /// Filter for the audit log file (stderr uses `RUST_LOG`).
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            pool: PoolSettings::default(),
            operation_timeout_secs: 30,
            max_backups: 5,
            log_level: "info".to_string(),
        }
    }
}

/// Pool sizing shared by every network adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub min_connections: u32,
    pub max_connections: u32,
    pub idle_timeout_secs: u64,
    pub acquire_timeout_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_connections: 0,
            max_connections: 5,
            idle_timeout_secs: 600,
            acquire_timeout_secs: 30,
        }
    }
}

impl PoolSettings {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs.max(1))
    }
}

/// `$DBCONN_CONFIG_DIR`, else `<user config dir>/db_connector`.
pub fn default_config_dir() -> PathBuf {
    if let Some(dir) = env_opt("DBCONN_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

impl Settings {
    /// Load settings for `config_dir` (or the default root).
    pub fn load(config_dir: Option<&Path>) -> Result<Self> {
        let root = config_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(default_config_dir);
        let path = root.join("settings.toml");

        let mut settings = if path.exists() {
            tracing::debug!(path = %path.display(), "Loading settings");
            let content = std::fs::read_to_string(&path)?;
            toml::from_str::<Settings>(&content).map_err(|e| Error::ConfigCorrupt {
                name: None,
                detail: format!("{}: {}", path.display(), e),
            })?
        } else {
            Settings::default()
        };
        settings.config_dir = root;
        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    /// Apply `DBCONN_*` environment overrides on top of file values.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse("DBCONN_POOL_MIN") {
            self.pool.min_connections = v;
        }
        if let Some(v) = env_parse("DBCONN_POOL_MAX") {
            self.pool.max_connections = v;
        }
        if let Some(v) = env_parse("DBCONN_POOL_IDLE_SECS") {
            self.pool.idle_timeout_secs = v;
        }
        if let Some(v) = env_parse("DBCONN_ACQUIRE_TIMEOUT_SECS") {
            self.pool.acquire_timeout_secs = v;
        }
        if let Some(v) = env_parse("DBCONN_OPERATION_TIMEOUT_SECS") {
            self.operation_timeout_secs = v;
        }
        if let Some(v) = env_parse("DBCONN_MAX_BACKUPS") {
            self.max_backups = v;
        }
        if let Some(v) = env_opt("DBCONN_LOG_LEVEL") {
            self.log_level = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool.max_connections == 0 {
            return Err(Error::Validation("pool.max_connections must be at least 1".into()));
        }
        if self.pool.min_connections > self.pool.max_connections {
            return Err(Error::Validation(format!(
                "pool.min_connections ({}) exceeds pool.max_connections ({})",
                self.pool.min_connections, self.pool.max_connections
            )));
        }
        if self.operation_timeout_secs == 0 {
            return Err(Error::Validation("operation_timeout_secs must be non-zero".into()));
        }
        Ok(())
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn connections_path(&self) -> PathBuf {
        self.config_dir.join("connections.toml")
    }

    pub fn key_path(&self) -> PathBuf {
        self.config_dir.join("encryption.key")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.config_dir.join("logs")
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Settings loaded:");
        tracing::info!("  config_dir:  {}", self.config_dir.display());
        tracing::info!(
            "  pool:        min={}, max={}, idle={}s",
            self.pool.min_connections,
            self.pool.max_connections,
            self.pool.idle_timeout_secs
        );
        tracing::info!("  timeout:     {}s", self.operation_timeout_secs);
    }
}

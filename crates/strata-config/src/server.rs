use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::diagnostics::{deserialize_toml_with_unknown_keys, ConfigDiagnostics};
use crate::{ConfigError, LoggingConfig};

/// Environment variable that points at the server config file when no explicit path is given.
pub const SERVER_CONFIG_ENV_VAR: &str = "STRATA_CONFIG_PATH";

/// Process-wide configuration (`strata.toml`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub autoload: AutoloadConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How sessions schedule their background maintenance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Long-running process: sessions persist their state periodically.
    #[default]
    Server,
    /// One-shot process: sessions persist only when synced or closed.
    Cli,
}

/// The `[autoload]` table: session cache and store policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoloadConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Store path template. May contain `%{euid}` and `%{schema}`; relative paths are resolved
    /// against the repository root. Sessions are disabled while this is empty.
    #[serde(default)]
    pub db_path: String,

    #[serde(default = "default_true")]
    pub db_can_create: bool,

    /// Group that should own newly created stores.
    #[serde(default)]
    pub db_group: String,

    /// Octal permission bits for newly created stores.
    #[serde(default = "AutoloadConfig::default_db_perms")]
    pub db_perms: String,

    /// While this file exists, sessions queue file changes instead of applying them.
    #[serde(default)]
    pub update_suppression_path: String,

    #[serde(default = "AutoloadConfig::default_idle_seconds")]
    pub map_idle_gc_seconds: u64,

    /// Extra attempts made when connecting a watch subscription.
    #[serde(default)]
    pub watch_retries: u32,

    #[serde(default)]
    pub include_repo_options_in_cache_breaker: bool,

    #[serde(default)]
    pub execution_mode: ExecutionMode,

    #[serde(default = "AutoloadConfig::default_maintenance_seconds")]
    pub maintenance_interval_seconds: u64,
}

fn default_true() -> bool {
    true
}

impl AutoloadConfig {
    pub const DEFAULT_IDLE_SECONDS: u64 = 1800;

    fn default_db_perms() -> String {
        "0644".to_owned()
    }

    fn default_idle_seconds() -> u64 {
        Self::DEFAULT_IDLE_SECONDS
    }

    fn default_maintenance_seconds() -> u64 {
        60
    }

    /// Whether a session factory should be started at all.
    pub fn sessions_enabled(&self) -> bool {
        self.enabled && !self.db_path.trim().is_empty()
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.map_idle_gc_seconds)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_seconds.max(1))
    }

    pub fn update_suppression_path(&self) -> Option<PathBuf> {
        let trimmed = self.update_suppression_path.trim();
        (!trimmed.is_empty()).then(|| PathBuf::from(trimmed))
    }
}

impl Default for AutoloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: String::new(),
            db_can_create: true,
            db_group: String::new(),
            db_perms: Self::default_db_perms(),
            update_suppression_path: String::new(),
            map_idle_gc_seconds: Self::DEFAULT_IDLE_SECONDS,
            watch_retries: 0,
            include_repo_options_in_cache_breaker: false,
            execution_mode: ExecutionMode::Server,
            maintenance_interval_seconds: Self::default_maintenance_seconds(),
        }
    }
}

impl ServerConfig {
    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load a config file from TOML.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::load_from_path_with_diagnostics(path).map(|(config, _)| config)
    }

    /// Load a config file and report keys that were ignored. Unknown keys are also logged.
    pub fn load_from_path_with_diagnostics(
        path: impl AsRef<Path>,
    ) -> Result<(Self, ConfigDiagnostics), ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let (config, diagnostics) = Self::load_from_str_with_diagnostics(&text)?;
        diagnostics.log(&path.display().to_string());
        Ok((config, diagnostics))
    }

    pub fn load_from_str_with_diagnostics(
        text: &str,
    ) -> Result<(Self, ConfigDiagnostics), ConfigError> {
        let (config, unknown_keys) = deserialize_toml_with_unknown_keys::<ServerConfig>(text)?;
        Ok((config, ConfigDiagnostics { unknown_keys }))
    }

    /// Loads the server config from `explicit`, or from [`SERVER_CONFIG_ENV_VAR`], falling back
    /// to defaults when neither is set. Returns the path that was read, if any.
    pub fn load(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        let Some(path) = discover_server_config(explicit) else {
            return Ok((ServerConfig::default(), None));
        };
        let config = Self::load_from_path(&path)?;
        Ok((config, Some(path)))
    }
}

/// Locates the server config file: an explicit path wins over [`SERVER_CONFIG_ENV_VAR`].
pub fn discover_server_config(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    std::env::var_os(SERVER_CONFIG_ENV_VAR)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

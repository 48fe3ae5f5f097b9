//! Configuration for strata.
//!
//! Two files are involved:
//! - the process-wide [`ServerConfig`] (`strata.toml`), which sets the store policy, session
//!   cache tuning and logging;
//! - per-repository [`RepoOptions`] (`.strata.toml` in the repository root), which choose how
//!   the repository is watched and what is indexed.

use thiserror::Error;

mod diagnostics;
mod logging;
mod repo;
mod server;

pub use diagnostics::ConfigDiagnostics;
pub use logging::{init_tracing, LoggingConfig};
pub use repo::{discover_repo_root, RepoAutoloadOptions, RepoOptions, REPO_OPTIONS_FILE};
pub use server::{
    discover_server_config, AutoloadConfig, ExecutionMode, ServerConfig, SERVER_CONFIG_ENV_VAR,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // The default `Display` embeds a snippet of the input; keep just the message and line.
        let message = err.message().to_owned();
        match err.span() {
            Some(span) => ConfigError::Toml(format!("{message} (at byte {})", span.start)),
            None => ConfigError::Toml(message),
        }
    }
}

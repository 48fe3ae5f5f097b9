use std::io;
use std::path::PathBuf;

use strata_config::ConfigError;
use strata_storage::StorageError;
use strata_vfs::QueryError;
use thiserror::Error;

/// Why a repository's configuration could not be turned into a cache key.
#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("failed to resolve repository root {root}: {source}")]
    Root {
        root: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid watch query: {0}")]
    Query(#[from] QueryError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("failed to load repository options: {0}")]
    Options(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to open store for {root}: {source}")]
    Storage {
        root: PathBuf,
        #[source]
        source: StorageError,
    },
    #[error("failed to start change source for {root}: {source}")]
    Watcher {
        root: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to construct session for {root}: {message}")]
    Construction { root: PathBuf, message: String },
    #[error("failed to close session for {root}: {message}")]
    Close { root: PathBuf, message: String },
    #[error("session for {root} is closed")]
    Closed { root: PathBuf },
}

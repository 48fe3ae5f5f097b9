use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to resolve trusted store path {path}: {source}")]
    TrustedPath {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("store path template is empty")]
    EmptyPathTemplate,
    #[error("store {path} does not exist")]
    Missing { path: PathBuf },
    #[error("store {path} is opened read-only")]
    ReadOnly { path: PathBuf },
    #[error("io error on store {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed store manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("store {path} has schema version {found}, expected {expected}")]
    WrongSchema {
        path: PathBuf,
        expected: u64,
        found: u64,
    },
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

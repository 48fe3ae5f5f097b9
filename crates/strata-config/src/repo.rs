use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ConfigError;

/// Name of the per-repository options file. The directory containing it is the repository root.
pub const REPO_OPTIONS_FILE: &str = ".strata.toml";

/// Options read from a repository's `.strata.toml`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepoOptions {
    root: PathBuf,
    pub autoload: RepoAutoloadOptions,
}

/// The `[autoload]` table of `.strata.toml`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoAutoloadOptions {
    /// Watch-query JSON. Empty means the repository is crawled once instead of watched.
    pub query: String,
    /// Pre-built read-only store, relative to the root unless absolute.
    pub trusted_db_path: String,
    /// Method attributes whose uses are recorded in the index. Order is significant.
    pub indexed_method_attributes: Vec<String>,
    /// Changing this forces a fresh store through `%{schema}`.
    pub cache_breaker: String,
}

#[derive(Debug, Default, Deserialize)]
struct RepoOptionsFile {
    #[serde(default)]
    autoload: RepoAutoloadOptions,
}

impl RepoOptions {
    /// Default options rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            autoload: RepoAutoloadOptions::default(),
        }
    }

    /// Reads the options file at `path`. The repository root is the file's directory; a missing
    /// file yields default options for that root.
    pub fn for_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let dir = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let root = resolve_root(dir).map_err(|source| ConfigError::Io {
            path: dir.display().to_string(),
            source,
        })?;

        match std::fs::read_to_string(path) {
            Ok(text) => Self::load_from_str(root, &text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::new(root)),
            Err(source) => Err(ConfigError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    /// Reads `<root>/.strata.toml`.
    pub fn load_for_root(root: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::for_file(root.as_ref().join(REPO_OPTIONS_FILE))
    }

    pub fn load_from_str(root: impl Into<PathBuf>, text: &str) -> Result<Self, ConfigError> {
        let file: RepoOptionsFile = toml::from_str(text)?;
        Ok(Self {
            root: root.into(),
            autoload: file.autoload,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Content fingerprint of the options: SHA-256 hex over their canonical serialization.
    pub fn cache_key(&self) -> String {
        // Field order is fixed by the struct, so the JSON form is canonical.
        let bytes = serde_json::to_vec(&self.autoload).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

/// Walks up from `start` to the nearest directory containing [`REPO_OPTIONS_FILE`].
pub fn discover_repo_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(REPO_OPTIONS_FILE).is_file())
        .map(Path::to_path_buf)
}

fn resolve_root(dir: &Path) -> std::io::Result<PathBuf> {
    let absolute = std::path::absolute(dir)?;
    Ok(absolute.canonicalize().unwrap_or(absolute))
}

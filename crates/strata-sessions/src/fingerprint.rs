use std::fmt;
use std::path::{Path, PathBuf};

use strata_config::RepoOptions;
use strata_storage::{resolve_storage_identity, RepoStorageInputs, StorageIdentity, StoragePolicy};
use strata_vfs::WatchQuery;

use crate::FingerprintError;

/// Cache key for a session: everything about a repository's effective configuration that changes
/// what the session indexes or where it stores it.
///
/// Fingerprints are recomputed on every request. Two requests with semantically identical
/// configuration produce equal fingerprints; attribute lists compare in order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfigFingerprint {
    root: PathBuf,
    query: Option<WatchQuery>,
    indexed_attributes: Vec<String>,
    storage: StorageIdentity,
}

impl ConfigFingerprint {
    /// Derives the fingerprint for `options` under the process-wide store `policy`.
    ///
    /// Fails if the watch query is present but not a JSON object, or if a configured trusted
    /// store cannot be canonicalized.
    pub fn derive(options: &RepoOptions, policy: &StoragePolicy) -> Result<Self, FingerprintError> {
        let root = absolute_root(options.root())?;
        let query = WatchQuery::parse(&options.autoload.query)?;

        let inputs = RepoStorageInputs {
            trusted_db_path: options.autoload.trusted_db_path.clone(),
            options_cache_key: options.cache_key(),
            cache_breaker: options.autoload.cache_breaker.clone(),
        };
        let storage = resolve_storage_identity(&root, &inputs, policy)?;

        Ok(Self {
            root,
            query,
            indexed_attributes: options.autoload.indexed_method_attributes.clone(),
            storage,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn query(&self) -> Option<&WatchQuery> {
        self.query.as_ref()
    }

    pub fn indexed_attributes(&self) -> &[String] {
        &self.indexed_attributes
    }

    pub fn storage(&self) -> &StorageIdentity {
        &self.storage
    }
}

impl fmt::Display for ConfigFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} query=", self.root.display())?;
        match &self.query {
            Some(query) => write!(f, "{query}")?,
            None => f.write_str("<crawl>")?,
        }
        write!(
            f,
            " attributes=[{}] storage={}",
            self.indexed_attributes.join(","),
            self.storage
        )
    }
}

fn absolute_root(root: &Path) -> Result<PathBuf, FingerprintError> {
    if root.is_absolute() {
        return Ok(root.to_path_buf());
    }
    std::path::absolute(root).map_err(|source| FingerprintError::Root {
        root: root.to_path_buf(),
        source,
    })
}

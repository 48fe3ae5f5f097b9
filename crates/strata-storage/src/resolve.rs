use std::ffi::OsString;
use std::fs;
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::{StorageError, StorageIdentity};

/// Version of the on-disk store layout. Part of the `%{schema}` cache breaker, so bumping it
/// sends every repository to a fresh store.
pub const SCHEMA_VERSION: u64 = 1916337637;

pub const EUID_PLACEHOLDER: &str = "%{euid}";
pub const SCHEMA_PLACEHOLDER: &str = "%{schema}";

/// Mode used for newly created stores when the configured bits cannot be parsed.
pub const DEFAULT_PERMISSION_BITS: u32 = 0o644;

const HASH_PREFIX_LEN: usize = 10;

/// Process-wide store policy, set by the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePolicy {
    /// Store path, possibly containing `%{euid}` and `%{schema}`. Relative results are resolved
    /// against the repository root.
    pub path_template: String,
    pub can_create: bool,
    /// Group name that should own newly created stores. Empty means no group is enforced.
    pub group: String,
    /// Octal permission bits for newly created stores.
    pub permission_bits: String,
    /// Whether `%{schema}` hashes the full repository options or only their cache breaker.
    pub include_repo_options_in_cache_breaker: bool,
}

impl Default for StoragePolicy {
    fn default() -> Self {
        Self {
            path_template: String::new(),
            can_create: true,
            group: String::new(),
            permission_bits: "0644".to_string(),
            include_repo_options_in_cache_breaker: false,
        }
    }
}

/// The repository-provided inputs to store resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoStorageInputs {
    /// Pre-built read-only store. Empty when the repository has none.
    pub trusted_db_path: String,
    /// Content fingerprint of the repository options.
    pub options_cache_key: String,
    pub cache_breaker: String,
}

/// Decides which store a repository uses.
///
/// A configured trusted path always wins and must canonicalize; otherwise the path template is
/// resolved and the policy decides between a created and a pre-existing writable store. A
/// missing `WritableExisting` store is only reported when the session opens it.
pub fn resolve_storage_identity(
    root: &Path,
    inputs: &RepoStorageInputs,
    policy: &StoragePolicy,
) -> Result<StorageIdentity, StorageError> {
    if !inputs.trusted_db_path.is_empty() {
        let configured = PathBuf::from(&inputs.trusted_db_path);
        let joined = if configured.is_relative() {
            root.join(&configured)
        } else {
            configured
        };
        let path = fs::canonicalize(&joined).map_err(|source| StorageError::TrustedPath {
            path: joined.clone(),
            source,
        })?;
        tracing::debug!(
            target: "strata.storage",
            root = %root.display(),
            path = %path.display(),
            "using trusted read-only store"
        );
        return Ok(StorageIdentity::ReadOnlyTrusted { path });
    }

    let path = resolve_db_path(root, inputs, policy)?;
    if policy.can_create {
        Ok(StorageIdentity::WritableCreate {
            path,
            group: resolve_group(&policy.group),
            permission_bits: parse_permission_bits(&policy.permission_bits),
        })
    } else {
        Ok(StorageIdentity::WritableExisting { path })
    }
}

/// Expands the policy's path template for `root` into an absolute, lexically normalized path.
pub fn resolve_db_path(
    root: &Path,
    inputs: &RepoStorageInputs,
    policy: &StoragePolicy,
) -> Result<PathBuf, StorageError> {
    if policy.path_template.is_empty() {
        return Err(StorageError::EmptyPathTemplate);
    }

    let expanded = substitute_template(
        &policy.path_template,
        || effective_uid().to_string(),
        || schema_fingerprint(root, inputs, policy.include_repo_options_in_cache_breaker),
    );

    let mut path = PathBuf::from(expanded);
    if path.is_relative() {
        path = root.join(path);
    }
    if path.is_relative() {
        path = std::path::absolute(&path).map_err(|err| StorageError::io(&path, err))?;
    }
    Ok(normalize_lexically(&path))
}

/// Replaces the first occurrence of each placeholder. Values are only computed for placeholders
/// that appear in the template.
pub fn substitute_template(
    template: &str,
    euid: impl FnOnce() -> String,
    schema: impl FnOnce() -> String,
) -> String {
    let mut out = template.to_string();
    if out.contains(EUID_PLACEHOLDER) {
        out = out.replacen(EUID_PLACEHOLDER, &euid(), 1);
    }
    if out.contains(SCHEMA_PLACEHOLDER) {
        out = out.replacen(SCHEMA_PLACEHOLDER, &schema(), 1);
    }
    out
}

/// The `%{schema}` token: `{SCHEMA_VERSION}_{options hash}_{root hash}`.
pub fn schema_fingerprint(
    root: &Path,
    inputs: &RepoStorageInputs,
    include_repo_options: bool,
) -> String {
    let options = if include_repo_options {
        inputs.options_cache_key.as_str()
    } else {
        inputs.cache_breaker.as_str()
    };
    let options_hash = short_hash(options.as_bytes());
    let root_hash = short_hash(root.as_os_str().as_encoded_bytes());

    tracing::info!(
        target: "strata.storage",
        schema_version = SCHEMA_VERSION,
        include_repo_options,
        options_hash = %options_hash,
        root = %root.display(),
        root_hash = %root_hash,
        "computed store cache breaker"
    );

    format!("{SCHEMA_VERSION}_{options_hash}_{root_hash}")
}

fn short_hash(bytes: &[u8]) -> String {
    let mut hex = hex::encode(Sha256::digest(bytes));
    hex.truncate(HASH_PREFIX_LEN);
    hex
}

/// Resolves a group name to its numeric id. Empty names resolve to `None` silently; unknown
/// names are logged and also resolve to `None`.
pub fn resolve_group(name: &str) -> Option<u32> {
    if name.is_empty() {
        return None;
    }

    #[cfg(unix)]
    {
        match nix::unistd::Group::from_name(name) {
            Ok(Some(group)) => Some(group.gid.as_raw()),
            Ok(None) => {
                tracing::warn!(
                    target: "strata.storage",
                    group = name,
                    "store group does not exist; not enforcing a group"
                );
                None
            }
            Err(err) => {
                tracing::warn!(
                    target: "strata.storage",
                    group = name,
                    error = %err,
                    "failed to look up store group; not enforcing a group"
                );
                None
            }
        }
    }

    #[cfg(not(unix))]
    {
        tracing::warn!(
            target: "strata.storage",
            group = name,
            "store groups are not supported on this platform"
        );
        None
    }
}

/// Parses octal permission bits such as `"0644"`, falling back to
/// [`DEFAULT_PERMISSION_BITS`] when the text is not a valid mode.
pub fn parse_permission_bits(text: &str) -> u32 {
    let trimmed = text.trim();
    let digits = trimmed.strip_prefix("0o").unwrap_or(trimmed);
    match u32::from_str_radix(digits, 8) {
        Ok(bits) if bits <= 0o7777 => {
            tracing::debug!(
                target: "strata.storage",
                raw = text,
                mode = %format!("{bits:04o}"),
                "parsed store permission bits"
            );
            bits
        }
        Ok(_) => {
            tracing::warn!(
                target: "strata.storage",
                raw = text,
                fallback = %format!("{DEFAULT_PERMISSION_BITS:04o}"),
                "store permission bits out of range"
            );
            DEFAULT_PERMISSION_BITS
        }
        Err(err) => {
            tracing::warn!(
                target: "strata.storage",
                raw = text,
                error = %err,
                fallback = %format!("{DEFAULT_PERMISSION_BITS:04o}"),
                "invalid store permission bits"
            );
            DEFAULT_PERMISSION_BITS
        }
    }
}

#[cfg(unix)]
fn effective_uid() -> u32 {
    nix::unistd::geteuid().as_raw()
}

#[cfg(not(unix))]
fn effective_uid() -> u32 {
    0
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    let mut stack: Vec<OsString> = Vec::new();

    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                stack.pop();
            }
            Component::Normal(segment) => stack.push(segment.to_owned()),
        }
    }

    out.extend(stack);
    out
}

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{write_file_atomic, StorageError, StorageIdentity, SCHEMA_VERSION};

/// Persisted state of a session: the root-relative files it tracks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreManifest {
    pub schema_version: u64,
    pub root: PathBuf,
    #[serde(default)]
    pub files: BTreeSet<PathBuf>,
}

impl StoreManifest {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            root: root.into(),
            files: BTreeSet::new(),
        }
    }
}

/// An opened backing store.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    identity: StorageIdentity,
    root: PathBuf,
}

impl StoreHandle {
    /// Opens the store described by `identity` for the repository at `root`.
    ///
    /// Read-only and existing-mode stores must already exist. Create-mode stores are created
    /// (with their parent directories) using the identity's permission bits and group.
    pub fn open(identity: &StorageIdentity, root: &Path) -> Result<Self, StorageError> {
        let handle = Self {
            identity: identity.clone(),
            root: root.to_path_buf(),
        };

        match identity {
            StorageIdentity::ReadOnlyTrusted { path } | StorageIdentity::WritableExisting { path } => {
                if !path.is_file() {
                    return Err(StorageError::Missing { path: path.clone() });
                }
            }
            StorageIdentity::WritableCreate {
                path,
                group,
                permission_bits,
            } => handle.create_if_missing(path, *group, *permission_bits)?,
        }

        // Surface malformed or stale stores at open time rather than on first use.
        handle.load()?;
        tracing::debug!(
            target: "strata.storage",
            store = %identity,
            root = %root.display(),
            "opened store"
        );
        Ok(handle)
    }

    pub fn identity(&self) -> &StorageIdentity {
        &self.identity
    }

    pub fn path(&self) -> &Path {
        self.identity.path()
    }

    pub fn is_read_only(&self) -> bool {
        self.identity.is_read_only()
    }

    /// Reads the manifest. An empty store file reads as an empty manifest.
    pub fn load(&self) -> Result<StoreManifest, StorageError> {
        let path = self.path();
        let bytes = fs::read(path).map_err(|err| StorageError::io(path, err))?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(StoreManifest::new(&self.root));
        }

        let manifest: StoreManifest =
            serde_json::from_slice(&bytes).map_err(|source| StorageError::Manifest {
                path: path.to_path_buf(),
                source,
            })?;
        if manifest.schema_version != SCHEMA_VERSION {
            return Err(StorageError::WrongSchema {
                path: path.to_path_buf(),
                expected: SCHEMA_VERSION,
                found: manifest.schema_version,
            });
        }
        Ok(manifest)
    }

    pub fn save(&self, manifest: &StoreManifest) -> Result<(), StorageError> {
        let path = self.path();
        if self.is_read_only() {
            return Err(StorageError::ReadOnly {
                path: path.to_path_buf(),
            });
        }

        let bytes = serde_json::to_vec_pretty(manifest).map_err(|source| {
            StorageError::Manifest {
                path: path.to_path_buf(),
                source,
            }
        })?;
        write_file_atomic(path, &bytes)
    }

    fn create_if_missing(
        &self,
        path: &Path,
        group: Option<u32>,
        permission_bits: u32,
    ) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| StorageError::io(parent, err))?;
        }

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(permission_bits);
        }

        let mut file = match options.open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Ok(()),
            Err(err) => return Err(StorageError::io(path, err)),
        };

        let result = (|| -> io::Result<()> {
            // The umask may have cleared bits from the requested mode.
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                file.set_permissions(fs::Permissions::from_mode(permission_bits))?;
                if let Some(gid) = group {
                    std::os::unix::fs::fchown(&file, None, Some(gid))?;
                }
            }
            #[cfg(not(unix))]
            let _ = (permission_bits, group);

            let bytes = serde_json::to_vec_pretty(&StoreManifest::new(&self.root))?;
            file.write_all(&bytes)?;
            file.sync_all()
        })();

        if let Err(err) = result {
            drop(file);
            let _ = fs::remove_file(path);
            return Err(StorageError::io(path, err));
        }

        tracing::info!(
            target: "strata.storage",
            path = %path.display(),
            mode = %format!("{permission_bits:04o}"),
            gid = ?group,
            "created store"
        );
        Ok(())
    }
}

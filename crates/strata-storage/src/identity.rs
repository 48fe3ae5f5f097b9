use std::fmt;
use std::path::{Path, PathBuf};

/// Where a session's backing store lives and how it may be opened.
///
/// Equality and hashing cover the variant as well as every field: the same path opened with a
/// different write mode is a different identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StorageIdentity {
    /// A pre-built store that is only ever read. The path is canonical and existed at
    /// resolution time.
    ReadOnlyTrusted { path: PathBuf },
    /// A writable store that is created if missing.
    WritableCreate {
        path: PathBuf,
        /// Numeric group that should own a newly created store.
        group: Option<u32>,
        permission_bits: u32,
    },
    /// A writable store that must already exist when the session opens it.
    WritableExisting { path: PathBuf },
}

impl StorageIdentity {
    pub fn path(&self) -> &Path {
        match self {
            StorageIdentity::ReadOnlyTrusted { path }
            | StorageIdentity::WritableCreate { path, .. }
            | StorageIdentity::WritableExisting { path } => path,
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, StorageIdentity::ReadOnlyTrusted { .. })
    }

    pub fn is_writable(&self) -> bool {
        !self.is_read_only()
    }
}

impl fmt::Display for StorageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageIdentity::ReadOnlyTrusted { path } => {
                write!(f, "ReadOnlyTrusted({})", path.display())
            }
            StorageIdentity::WritableCreate {
                path,
                group,
                permission_bits,
            } => {
                write!(f, "WritableCreate({}, ", path.display())?;
                match group {
                    Some(gid) => write!(f, "gid={gid}, ")?,
                    None => write!(f, "gid=none, ")?,
                }
                write!(f, "mode={permission_bits:04o})")
            }
            StorageIdentity::WritableExisting { path } => {
                write!(f, "WritableExisting({})", path.display())
            }
        }
    }
}

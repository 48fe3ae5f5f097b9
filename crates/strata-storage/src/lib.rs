//! Backing-store identity and access for strata sessions.
//!
//! A repository's store is described by a [`StorageIdentity`]: either a pre-built read-only
//! trusted store, or a writable store that is created on demand (with a permission mode and an
//! optional owning group) or must already exist. [`resolve_storage_identity`] picks the variant
//! from a [`StoragePolicy`] and the repository's [`RepoStorageInputs`]; the result is part of the
//! session cache key, so two configurations that resolve to the same effective store share a
//! session.
//!
//! [`StoreHandle`] opens the store described by an identity. The store itself is a small JSON
//! manifest listing the files a session tracks.

mod error;
mod identity;
mod resolve;
mod store;
mod write;

pub use error::StorageError;
pub use identity::StorageIdentity;
pub use resolve::{
    parse_permission_bits, resolve_db_path, resolve_group, resolve_storage_identity,
    schema_fingerprint, substitute_template, RepoStorageInputs, StoragePolicy,
    DEFAULT_PERMISSION_BITS, EUID_PLACEHOLDER, SCHEMA_PLACEHOLDER, SCHEMA_VERSION,
};
pub use store::{StoreHandle, StoreManifest};
pub use write::write_file_atomic;

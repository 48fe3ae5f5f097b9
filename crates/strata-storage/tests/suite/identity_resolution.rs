use std::fs;
use std::path::{Path, PathBuf};

use strata_storage::{
    resolve_storage_identity, RepoStorageInputs, StorageError, StorageIdentity, StoragePolicy,
    StoreHandle, SCHEMA_VERSION,
};

fn create_policy(template: &str) -> StoragePolicy {
    StoragePolicy {
        path_template: template.to_string(),
        can_create: true,
        ..StoragePolicy::default()
    }
}

#[test]
fn trusted_path_wins_over_create_policy() {
    let repo = tempfile::tempdir().unwrap();
    let trusted = repo.path().join("prebuilt.json");
    fs::write(&trusted, b"").unwrap();

    let inputs = RepoStorageInputs {
        trusted_db_path: trusted.display().to_string(),
        ..RepoStorageInputs::default()
    };
    let identity = resolve_storage_identity(
        repo.path(),
        &inputs,
        &create_policy("/tmp/db_%{euid}_%{schema}.json"),
    )
    .unwrap();

    assert_eq!(
        identity,
        StorageIdentity::ReadOnlyTrusted {
            path: fs::canonicalize(&trusted).unwrap(),
        }
    );
}

#[test]
fn relative_trusted_path_resolves_against_root() {
    let repo = tempfile::tempdir().unwrap();
    fs::create_dir(repo.path().join("db")).unwrap();
    fs::write(repo.path().join("db/prebuilt.json"), b"").unwrap();

    let inputs = RepoStorageInputs {
        trusted_db_path: "db/../db/prebuilt.json".to_string(),
        ..RepoStorageInputs::default()
    };
    let identity =
        resolve_storage_identity(repo.path(), &inputs, &StoragePolicy::default()).unwrap();

    let expected = fs::canonicalize(repo.path().join("db/prebuilt.json")).unwrap();
    assert_eq!(identity.path(), expected);
    assert!(identity.is_read_only());
}

#[test]
fn missing_trusted_path_is_an_error() {
    let repo = tempfile::tempdir().unwrap();
    let inputs = RepoStorageInputs {
        trusted_db_path: "does/not/exist.json".to_string(),
        ..RepoStorageInputs::default()
    };

    let err = resolve_storage_identity(repo.path(), &inputs, &create_policy("/tmp/x.json"))
        .unwrap_err();
    match err {
        StorageError::TrustedPath { path, .. } => {
            assert_eq!(path, repo.path().join("does/not/exist.json"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[cfg(unix)]
#[test]
fn euid_and_schema_are_substituted() {
    let identity = resolve_storage_identity(
        Path::new("/repo"),
        &RepoStorageInputs::default(),
        &create_policy("/tmp/db_%{euid}_%{schema}.sql"),
    )
    .unwrap();

    let StorageIdentity::WritableCreate {
        path,
        group,
        permission_bits,
    } = identity
    else {
        panic!("expected a create-mode identity, got {identity:?}");
    };

    let euid = nix::unistd::geteuid().as_raw();
    let name = path.file_name().unwrap().to_str().unwrap().to_string();
    assert!(path.starts_with("/tmp"));
    assert!(
        name.starts_with(&format!("db_{euid}_{SCHEMA_VERSION}_")),
        "unexpected store name {name}"
    );
    assert!(name.ends_with(".sql"));
    assert_eq!(group, None);
    assert_eq!(permission_bits, 0o644);
}

#[test]
fn equivalent_templates_resolve_to_the_same_identity() {
    let root = Path::new("/srv/repo");
    let inputs = RepoStorageInputs::default();

    let a = resolve_storage_identity(root, &inputs, &create_policy("/var/db/store.json")).unwrap();
    let b = resolve_storage_identity(root, &inputs, &create_policy("../../var/db/./store.json"))
        .unwrap();

    assert_eq!(a, b);
}

#[test]
fn existing_mode_store_fails_only_when_opened() {
    let repo = tempfile::tempdir().unwrap();
    let policy = StoragePolicy {
        path_template: "store.json".to_string(),
        can_create: false,
        ..StoragePolicy::default()
    };

    let identity =
        resolve_storage_identity(repo.path(), &RepoStorageInputs::default(), &policy).unwrap();
    assert_eq!(
        identity,
        StorageIdentity::WritableExisting {
            path: PathBuf::from(repo.path()).join("store.json"),
        }
    );

    let err = StoreHandle::open(&identity, repo.path()).unwrap_err();
    assert!(matches!(err, StorageError::Missing { .. }));
}

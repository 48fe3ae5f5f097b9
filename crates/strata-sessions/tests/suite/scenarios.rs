use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use strata_config::RepoOptions;
use strata_sessions::{ManualClock, SessionFactory, SessionSettings};
use strata_storage::{StorageIdentity, StoragePolicy, SCHEMA_VERSION};
use strata_vfs::{ChangeSourceKind, ManualWatchService};

fn factory(template: String, idle: Duration, clock: &ManualClock) -> SessionFactory {
    let settings = SessionSettings {
        storage: StoragePolicy {
            path_template: template,
            can_create: true,
            ..StoragePolicy::default()
        },
        idle_threshold: idle,
        ..SessionSettings::default()
    };
    SessionFactory::builder(settings)
        .watch_service(Arc::new(ManualWatchService::new()))
        .clock(Arc::new(clock.clone()))
        .build()
}

fn options(root: PathBuf, query: &str, attributes: &[&str]) -> RepoOptions {
    let mut options = RepoOptions::new(root);
    options.autoload.query = query.to_owned();
    options.autoload.indexed_method_attributes =
        attributes.iter().map(|s| s.to_string()).collect();
    options
}

#[test]
fn euid_and_schema_template_builds_once() {
    let repo = tempfile::tempdir().unwrap();
    let stores = tempfile::tempdir().unwrap();
    std::fs::write(repo.path().join("index.php"), "<?hh").unwrap();

    let clock = ManualClock::new();
    let template = stores
        .path()
        .join("db_%{euid}_%{schema}.sql")
        .display()
        .to_string();
    let factory = factory(template, Duration::from_secs(1800), &clock);
    let options = options(repo.path().to_path_buf(), "", &["Foo"]);

    let first = factory.get_or_create(&options).unwrap().unwrap();
    let StorageIdentity::WritableCreate { path, .. } = first.storage() else {
        panic!("expected a create-mode store, got {}", first.storage());
    };
    let name = path.file_name().unwrap().to_string_lossy().into_owned();
    let rest = name.strip_prefix("db_").unwrap();
    let (euid, schema) = rest.split_once('_').unwrap();
    assert!(euid.chars().all(|c| c.is_ascii_digit()), "{name}");
    assert!(schema.starts_with(&format!("{SCHEMA_VERSION}_")), "{name}");
    assert!(schema.ends_with(".sql"), "{name}");

    assert_eq!(first.change_source(), Some(ChangeSourceKind::Static));
    assert_eq!(first.tracked_files(), vec![PathBuf::from("index.php")]);

    let second = factory.get_or_create(&options).unwrap().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(factory.len(), 1);
}

#[test]
fn invalid_query_json_yields_no_session() {
    let stores = tempfile::tempdir().unwrap();
    let clock = ManualClock::new();
    let factory = factory(
        stores.path().join("db.json").display().to_string(),
        Duration::from_secs(1800),
        &clock,
    );

    let options = options(PathBuf::from("/repo"), "{not valid json", &[]);
    assert!(factory.get_or_create(&options).unwrap().is_none());
    assert!(factory.is_empty());
}

#[test]
fn idle_session_is_closed_and_rebuilt() {
    let repo = tempfile::tempdir().unwrap();
    let stores = tempfile::tempdir().unwrap();
    let clock = ManualClock::new();
    let factory = factory(
        stores.path().join("db_%{schema}.json").display().to_string(),
        Duration::from_secs(1),
        &clock,
    );
    let options = options(repo.path().to_path_buf(), "", &[]);

    let first = factory.get_or_create(&options).unwrap().unwrap();
    clock.advance(Duration::from_secs(2));
    assert_eq!(factory.garbage_collect_idle(Duration::from_secs(1)), 1);
    assert!(first.is_closed());
    assert!(factory.is_empty());

    let second = factory.get_or_create(&options).unwrap().unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(!second.is_closed());
}

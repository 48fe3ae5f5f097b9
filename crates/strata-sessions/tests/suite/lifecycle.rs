use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use strata_config::{ExecutionMode, RepoOptions, REPO_OPTIONS_FILE};
use strata_sessions::{ManualClock, Session, SessionError, SessionFactory, SessionSettings};
use strata_storage::{StorageIdentity, StoragePolicy, StoreHandle};
use strata_vfs::{ChangeSourceKind, FileChange, ManualWatchService, WatchEvent};

struct Harness {
    store_dir: tempfile::TempDir,
    repo_dir: tempfile::TempDir,
    watch: ManualWatchService,
    clock: ManualClock,
    factory: SessionFactory,
}

fn harness(configure: impl FnOnce(&mut SessionSettings)) -> Harness {
    let store_dir = tempfile::tempdir().unwrap();
    let repo_dir = tempfile::tempdir().unwrap();
    fs::write(
        repo_dir.path().join(REPO_OPTIONS_FILE),
        r#"
[autoload]
query = '{"expression": ["anyof", ["suffix", "php"], ["suffix", "hck"]]}'
indexed_method_attributes = ["Foo"]
"#,
    )
    .unwrap();

    let mut settings = SessionSettings {
        storage: StoragePolicy {
            path_template: store_dir
                .path()
                .join("%{schema}/db.json")
                .display()
                .to_string(),
            ..StoragePolicy::default()
        },
        execution_mode: ExecutionMode::Cli,
        ..SessionSettings::default()
    };
    configure(&mut settings);

    let watch = ManualWatchService::new();
    let clock = ManualClock::new();
    let factory = SessionFactory::builder(settings)
        .watch_service(Arc::new(watch.clone()))
        .clock(Arc::new(clock.clone()))
        .build();

    Harness {
        store_dir,
        repo_dir,
        watch,
        clock,
        factory,
    }
}

impl Harness {
    fn options(&self) -> RepoOptions {
        RepoOptions::load_for_root(self.repo_dir.path()).unwrap()
    }

    fn root(&self) -> PathBuf {
        self.options().root().to_path_buf()
    }
}

#[test]
fn subscription_session_tracks_and_persists_changes() {
    let h = harness(|_| {});
    h.watch.set_initial_files(["src/a.php", "src/b.hck", "README.md"]);

    let session = h.factory.get_or_create(&h.options()).unwrap().unwrap();
    assert_eq!(session.change_source(), Some(ChangeSourceKind::Subscription));
    assert_eq!(
        session.tracked_files(),
        vec![PathBuf::from("src/a.php"), PathBuf::from("src/b.hck")]
    );

    let delivered = h.watch.push(
        &h.root(),
        WatchEvent::Changes {
            changes: vec![FileChange::Created {
                path: PathBuf::from("src/c.php"),
            }],
        },
    );
    assert_eq!(delivered, 1);
    session.ensure_updated().unwrap();
    assert!(session.tracked_files().contains(&PathBuf::from("src/c.php")));

    let store = StoreHandle::open(session.storage(), session.root()).unwrap();
    let manifest = store.load().unwrap();
    assert_eq!(manifest.files.len(), 3);
    assert!(store.path().starts_with(h.store_dir.path()));
}

#[test]
fn concurrent_requests_share_one_subscription() {
    let h = harness(|_| {});
    let options = h.options();
    let barrier = Barrier::new(6);

    let sessions: Vec<Arc<dyn Session>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..6)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    h.factory.get_or_create(&options).unwrap().unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
    assert_eq!(h.watch.connect_attempts(), 1);
    assert_eq!(h.watch.active_subscriptions(), 1);
}

#[test]
fn eviction_unsubscribes_the_session() {
    let h = harness(|settings| settings.idle_threshold = Duration::from_secs(30));
    let session = h.factory.get_or_create(&h.options()).unwrap().unwrap();
    assert_eq!(h.watch.active_subscriptions(), 1);

    h.clock.advance(Duration::from_secs(31));
    assert_eq!(h.factory.garbage_collect_idle(Duration::from_secs(30)), 1);
    assert!(session.is_closed());
    assert_eq!(h.watch.active_subscriptions(), 0);
    assert!(matches!(
        session.ensure_updated(),
        Err(SessionError::Closed { .. })
    ));
}

#[test]
fn connection_retries_are_bounded() {
    let h = harness(|settings| settings.watch_retries = 2);

    h.watch.fail_next_connects(3);
    let err = h.factory.get_or_create(&h.options()).unwrap_err();
    assert!(matches!(err, SessionError::Watcher { .. }), "{err}");
    assert_eq!(h.watch.connect_attempts(), 3);
    assert!(h.factory.is_empty());

    h.watch.fail_next_connects(2);
    let session = h.factory.get_or_create(&h.options()).unwrap().unwrap();
    assert_eq!(h.watch.connect_attempts(), 6);
    assert!(!session.is_closed());
    assert_eq!(h.factory.len(), 1);
}

#[test]
fn existing_mode_requires_the_store_at_construction() {
    let h = harness(|settings| settings.storage.can_create = false);
    let options = h.options();

    let err = h.factory.get_or_create(&options).unwrap_err();
    assert!(matches!(err, SessionError::Storage { .. }), "{err}");
    assert!(h.factory.is_empty());

    let path = h.factory.db_path(&h.root(), Path::new("/")).unwrap();
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, "").unwrap();

    let session = h.factory.get_or_create(&options).unwrap().unwrap();
    assert!(matches!(
        session.storage(),
        StorageIdentity::WritableExisting { .. }
    ));
}

#[test]
fn changing_repo_options_yields_a_new_session() {
    let h = harness(|_| {});
    let first = h.factory.get_or_create(&h.options()).unwrap().unwrap();

    fs::write(
        h.repo_dir.path().join(REPO_OPTIONS_FILE),
        r#"
[autoload]
query = '{"expression": ["anyof", ["suffix", "php"], ["suffix", "hck"]]}'
indexed_method_attributes = ["Foo", "Bar"]
"#,
    )
    .unwrap();
    let second = h.factory.get_or_create(&h.options()).unwrap().unwrap();

    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(h.factory.len(), 2);
}

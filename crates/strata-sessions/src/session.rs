//! Sessions: one live index per repository configuration.
//!
//! An [`IndexSession`] owns its store and, unless the store is a trusted read-only one, a
//! [`ChangeSource`] consumed by a dedicated watcher thread. The thread applies incoming events to
//! the tracked file set, persists it on maintenance ticks (server mode) and answers sync
//! requests. [`Session::close`] stops and joins the thread.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel as channel;
use parking_lot::Mutex;
use strata_config::ExecutionMode;
use strata_scheduler::panic_payload_to_str;
use strata_storage::{StorageError, StorageIdentity, StoreHandle, StoreManifest};
use strata_vfs::{ChangeSource, ChangeSourceKind, FileChange, WatchEvent, WatchMessage};

use crate::SessionError;

/// The lifecycle surface the session cache relies on.
pub trait Session: Send + Sync + fmt::Debug {
    fn root(&self) -> &Path;

    fn storage(&self) -> &StorageIdentity;

    /// How the session learns about file changes. `None` for trusted stores.
    fn change_source(&self) -> Option<ChangeSourceKind>;

    /// Blocks until every change already delivered to the session has been applied and
    /// persisted.
    fn ensure_updated(&self) -> Result<(), SessionError>;

    /// Root-relative files currently tracked, sorted.
    fn tracked_files(&self) -> Vec<PathBuf>;

    /// Stops background work and waits for it to finish. Calling it again does nothing.
    fn close(&self) -> Result<(), SessionError>;

    fn is_closed(&self) -> bool;
}

/// Everything needed to build one session.
#[derive(Debug)]
pub struct SessionRecipe {
    pub root: PathBuf,
    pub storage: StorageIdentity,
    /// Not started yet. `None` for trusted stores.
    pub change_source: Option<ChangeSource>,
    pub indexed_attributes: Vec<String>,
    pub execution_mode: ExecutionMode,
    pub update_suppression_path: Option<PathBuf>,
    pub maintenance_interval: Duration,
}

/// Constructs sessions for the cache. Called with the cache lock held.
pub trait SessionBuilder: Send + Sync {
    fn build(&self, recipe: SessionRecipe) -> Result<Arc<dyn Session>, SessionError>;
}

/// Builds [`IndexSession`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSessionBuilder;

impl SessionBuilder for DefaultSessionBuilder {
    fn build(&self, recipe: SessionRecipe) -> Result<Arc<dyn Session>, SessionError> {
        Ok(Arc::new(IndexSession::start(recipe)?))
    }
}

const COMMAND_QUEUE_CAPACITY: usize = 16;

enum Command {
    Sync(channel::Sender<Result<(), StorageError>>),
}

struct Control {
    stop: channel::Sender<()>,
    commands: channel::Sender<Command>,
    thread: thread::JoinHandle<()>,
}

#[derive(Debug, Default)]
struct TrackedFiles {
    files: BTreeSet<PathBuf>,
    /// Events held back while updates are suppressed, in arrival order.
    queued: Vec<WatchEvent>,
    dirty: bool,
}

impl TrackedFiles {
    fn apply(&mut self, event: WatchEvent) {
        match event {
            WatchEvent::Snapshot { files } => {
                self.files = files.into_iter().collect();
            }
            WatchEvent::Changes { changes } => {
                for change in changes {
                    match change {
                        FileChange::Created { path } | FileChange::Modified { path } => {
                            self.files.insert(path);
                        }
                        FileChange::Deleted { path } => {
                            self.files.remove(&path);
                        }
                        FileChange::Moved { from, to } => {
                            self.files.remove(&from);
                            self.files.insert(to);
                        }
                    }
                }
            }
            WatchEvent::Rescan => return,
        }
        self.dirty = true;
    }

    fn flush_queued(&mut self) {
        for event in std::mem::take(&mut self.queued) {
            self.apply(event);
        }
    }
}

/// State shared between a session and its watcher thread.
struct Shared {
    root: PathBuf,
    store: StoreHandle,
    update_suppression_path: Option<PathBuf>,
    tracked: Mutex<TrackedFiles>,
}

impl Shared {
    fn updates_suppressed(&self) -> bool {
        self.update_suppression_path
            .as_deref()
            .is_some_and(Path::exists)
    }

    fn deliver(&self, event: WatchEvent) {
        let suppressed = self.updates_suppressed();
        let mut tracked = self.tracked.lock();
        if suppressed {
            tracked.queued.push(event);
            tracing::debug!(
                target: "strata.sessions",
                root = %self.root.display(),
                queued = tracked.queued.len(),
                "updates suppressed; queued change batch"
            );
            return;
        }
        tracked.flush_queued();
        tracked.apply(event);
    }

    fn flush_if_unsuppressed(&self) {
        if !self.updates_suppressed() {
            self.tracked.lock().flush_queued();
        }
    }

    fn persist(&self) -> Result<(), StorageError> {
        if self.store.is_read_only() {
            return Ok(());
        }
        let manifest = {
            let mut tracked = self.tracked.lock();
            if !tracked.dirty {
                return Ok(());
            }
            tracked.dirty = false;
            StoreManifest {
                files: tracked.files.clone(),
                ..StoreManifest::new(&self.root)
            }
        };
        self.store.save(&manifest).inspect_err(|_| {
            self.tracked.lock().dirty = true;
        })
    }

    fn persist_logged(&self) {
        if let Err(err) = self.persist() {
            tracing::warn!(
                target: "strata.sessions",
                root = %self.root.display(),
                error = %err,
                "failed to persist session state"
            );
        }
    }
}

/// Applies one message from the change source. A rescan request restarts the source, which
/// delivers a fresh snapshot.
fn handle_message(shared: &Shared, source: &mut ChangeSource, msg: WatchMessage) {
    match msg {
        Ok(WatchEvent::Rescan) => {
            tracing::warn!(
                target: "strata.sessions",
                root = %shared.root.display(),
                "change source dropped events; resubscribing"
            );
            source.stop();
            if let Err(err) = source.start() {
                tracing::warn!(
                    target: "strata.sessions",
                    root = %shared.root.display(),
                    error = %err,
                    "failed to restart change source"
                );
            }
        }
        Ok(event) => shared.deliver(event),
        Err(err) => {
            tracing::warn!(
                target: "strata.sessions",
                root = %shared.root.display(),
                error = %err,
                "change source reported an error"
            );
        }
    }
}

fn run_watcher(
    shared: Arc<Shared>,
    mut source: ChangeSource,
    stop_rx: channel::Receiver<()>,
    command_rx: channel::Receiver<Command>,
    maintenance: Option<Duration>,
) {
    let events = source.receiver().clone();
    let mut source_open = true;
    let ticks = match maintenance {
        Some(interval) => channel::tick(interval),
        None => channel::never(),
    };

    loop {
        let active = if source_open {
            events.clone()
        } else {
            channel::never()
        };

        channel::select! {
            recv(stop_rx) -> _ => break,
            recv(command_rx) -> msg => {
                let Ok(Command::Sync(reply)) = msg else { break };
                if source_open {
                    for msg in events.try_iter() {
                        handle_message(&shared, &mut source, msg);
                    }
                }
                shared.flush_if_unsuppressed();
                let _ = reply.send(shared.persist());
            },
            recv(active) -> msg => match msg {
                Ok(msg) => handle_message(&shared, &mut source, msg),
                Err(_) => source_open = false,
            },
            recv(ticks) -> _ => {
                shared.flush_if_unsuppressed();
                shared.persist_logged();
            },
        }
    }

    source.stop();
    shared.flush_if_unsuppressed();
    shared.persist_logged();
}

/// The session implementation used outside tests.
pub struct IndexSession {
    shared: Arc<Shared>,
    storage: StorageIdentity,
    source_kind: Option<ChangeSourceKind>,
    indexed_attributes: Vec<String>,
    execution_mode: ExecutionMode,
    closed: AtomicBool,
    control: Mutex<Option<Control>>,
}

impl fmt::Debug for IndexSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexSession")
            .field("root", &self.shared.root)
            .field("storage", &self.storage)
            .field("source_kind", &self.source_kind)
            .field("execution_mode", &self.execution_mode)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl IndexSession {
    /// Opens the store, starts the change source and applies whatever it delivered up front
    /// (the initial snapshot), then hands the source to a watcher thread.
    pub fn start(recipe: SessionRecipe) -> Result<Self, SessionError> {
        let SessionRecipe {
            root,
            storage,
            change_source,
            indexed_attributes,
            execution_mode,
            update_suppression_path,
            maintenance_interval,
        } = recipe;

        let storage_err = |source| SessionError::Storage {
            root: root.clone(),
            source,
        };
        let store = StoreHandle::open(&storage, &root).map_err(storage_err)?;
        let manifest = store.load().map_err(storage_err)?;

        let shared = Arc::new(Shared {
            root: root.clone(),
            store,
            update_suppression_path,
            tracked: Mutex::new(TrackedFiles {
                files: manifest.files,
                ..TrackedFiles::default()
            }),
        });

        let source_kind = change_source.as_ref().map(ChangeSource::kind);
        let control = match change_source {
            None => None,
            Some(mut source) => {
                source.start().map_err(|source| SessionError::Watcher {
                    root: root.clone(),
                    source,
                })?;
                let events = source.receiver().clone();
                while let Ok(msg) = events.try_recv() {
                    handle_message(&shared, &mut source, msg);
                }
                shared.persist_logged();

                let maintenance =
                    (execution_mode == ExecutionMode::Server).then_some(maintenance_interval);
                Some(spawn_watcher(Arc::clone(&shared), source, maintenance)?)
            }
        };

        tracing::info!(
            target: "strata.sessions",
            root = %root.display(),
            store = %storage,
            source = ?source_kind,
            files = shared.tracked.lock().files.len(),
            "session started"
        );

        Ok(Self {
            shared,
            storage,
            source_kind,
            indexed_attributes,
            execution_mode,
            closed: AtomicBool::new(false),
            control: Mutex::new(control),
        })
    }

    pub fn indexed_attributes(&self) -> &[String] {
        &self.indexed_attributes
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.execution_mode
    }

    /// Number of change batches held back by update suppression.
    pub fn queued_batches(&self) -> usize {
        self.shared.tracked.lock().queued.len()
    }
}

fn spawn_watcher(
    shared: Arc<Shared>,
    source: ChangeSource,
    maintenance: Option<Duration>,
) -> Result<Control, SessionError> {
    let root = shared.root.clone();
    let (stop, stop_rx) = channel::bounded::<()>(1);
    let (commands, command_rx) = channel::bounded::<Command>(COMMAND_QUEUE_CAPACITY);
    let thread = thread::Builder::new()
        .name("strata-session-watcher".to_string())
        .spawn(move || run_watcher(shared, source, stop_rx, command_rx, maintenance))
        .map_err(|err| SessionError::Construction {
            root,
            message: format!("failed to spawn watcher thread: {err}"),
        })?;
    Ok(Control {
        stop,
        commands,
        thread,
    })
}

impl Session for IndexSession {
    fn root(&self) -> &Path {
        &self.shared.root
    }

    fn storage(&self) -> &StorageIdentity {
        &self.storage
    }

    fn change_source(&self) -> Option<ChangeSourceKind> {
        self.source_kind
    }

    fn ensure_updated(&self) -> Result<(), SessionError> {
        let closed = || SessionError::Closed {
            root: self.shared.root.clone(),
        };
        if self.is_closed() {
            return Err(closed());
        }

        let commands = self
            .control
            .lock()
            .as_ref()
            .map(|control| control.commands.clone());
        let Some(commands) = commands else {
            return Ok(());
        };

        let (reply, reply_rx) = channel::bounded(1);
        commands.send(Command::Sync(reply)).map_err(|_| closed())?;
        reply_rx
            .recv()
            .map_err(|_| closed())?
            .map_err(|source| SessionError::Storage {
                root: self.shared.root.clone(),
                source,
            })
    }

    fn tracked_files(&self) -> Vec<PathBuf> {
        self.shared.tracked.lock().files.iter().cloned().collect()
    }

    fn close(&self) -> Result<(), SessionError> {
        self.closed.store(true, Ordering::Release);
        let Some(control) = self.control.lock().take() else {
            return Ok(());
        };

        let _ = control.stop.try_send(());
        drop(control.commands);
        control
            .thread
            .join()
            .map_err(|panic| SessionError::Close {
                root: self.shared.root.clone(),
                message: format!(
                    "watcher thread panicked: {}",
                    panic_payload_to_str(&*panic)
                ),
            })?;

        tracing::debug!(
            target: "strata.sessions",
            root = %self.shared.root.display(),
            "session closed"
        );
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for IndexSession {
    fn drop(&mut self) {
        if self.control.get_mut().is_none() {
            return;
        }
        tracing::debug!(
            target: "strata.sessions",
            root = %self.shared.root.display(),
            "session dropped without close; closing"
        );
        if let Err(err) = self.close() {
            tracing::warn!(target: "strata.sessions", error = %err, "failed to close session");
        }
    }
}

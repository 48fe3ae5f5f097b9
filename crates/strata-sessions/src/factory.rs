use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use strata_config::{AutoloadConfig, RepoOptions};
use strata_scheduler::Treadmill;
use strata_storage::{resolve_storage_identity, RepoStorageInputs, StorageIdentity, SCHEMA_VERSION};
use strata_vfs::{select_change_source, NotifyWatchService, WatchService};

use crate::{
    Clock, ConfigFingerprint, DefaultSessionBuilder, FingerprintError, Session, SessionBuilder,
    SessionError, SessionRecipe, SessionSettings, SystemClock,
};

#[derive(Default)]
struct FactoryState {
    sessions: HashMap<ConfigFingerprint, Arc<dyn Session>>,
    last_used: HashMap<ConfigFingerprint, Instant>,
}

struct FactoryInner {
    settings: SessionSettings,
    builder: Arc<dyn SessionBuilder>,
    watch_service: Arc<dyn WatchService>,
    treadmill: Treadmill,
    clock: Arc<dyn Clock>,
    state: Mutex<FactoryState>,
}

/// The session cache: at most one live session per [`ConfigFingerprint`].
///
/// Sessions are built lazily on the first request for a fingerprint, while the cache lock is
/// held, so concurrent misses for the same configuration build once. Every miss schedules an idle
/// sweep on the factory's [`Treadmill`]; there is no sweep timer. Evicted sessions are closed
/// outside the lock and their last cache reference is retired through the treadmill, so callers
/// that bracket their work with [`Treadmill::start_request`] never observe a dropped session.
pub struct SessionFactory {
    inner: Arc<FactoryInner>,
}

impl std::fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFactory")
            .field("settings", &self.inner.settings)
            .field("sessions", &self.len())
            .field("treadmill", &self.inner.treadmill)
            .finish()
    }
}

/// Configures the collaborators of a [`SessionFactory`].
pub struct SessionFactoryBuilder {
    settings: SessionSettings,
    builder: Arc<dyn SessionBuilder>,
    watch_service: Arc<dyn WatchService>,
    treadmill: Treadmill,
    clock: Arc<dyn Clock>,
}

impl SessionFactoryBuilder {
    pub fn session_builder(mut self, builder: Arc<dyn SessionBuilder>) -> Self {
        self.builder = builder;
        self
    }

    pub fn watch_service(mut self, service: Arc<dyn WatchService>) -> Self {
        self.watch_service = service;
        self
    }

    pub fn treadmill(mut self, treadmill: Treadmill) -> Self {
        self.treadmill = treadmill;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> SessionFactory {
        SessionFactory {
            inner: Arc::new(FactoryInner {
                settings: self.settings,
                builder: self.builder,
                watch_service: self.watch_service,
                treadmill: self.treadmill,
                clock: self.clock,
                state: Mutex::new(FactoryState::default()),
            }),
        }
    }
}

impl SessionFactory {
    pub fn new(settings: SessionSettings) -> Self {
        Self::builder(settings).build()
    }

    /// Starts from [`IndexSession`](crate::IndexSession)s, the OS file watcher, a fresh treadmill
    /// and the system clock.
    pub fn builder(settings: SessionSettings) -> SessionFactoryBuilder {
        SessionFactoryBuilder {
            settings,
            builder: Arc::new(DefaultSessionBuilder),
            watch_service: Arc::new(NotifyWatchService::new()),
            treadmill: Treadmill::new(),
            clock: Arc::new(SystemClock),
        }
    }

    /// The factory for a server config, or `None` when sessions are disabled there.
    pub fn from_config(config: &AutoloadConfig) -> Option<Self> {
        if !config.sessions_enabled() {
            tracing::info!(
                target: "strata.sessions",
                enabled = config.enabled,
                "session autoload disabled (no db_path configured or autoload.enabled = false)"
            );
            return None;
        }
        Some(Self::new(SessionSettings::from_autoload(config)))
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.inner.settings
    }

    /// The deferred-work facility evicted sessions are retired through.
    pub fn treadmill(&self) -> &Treadmill {
        &self.inner.treadmill
    }

    pub fn schema_version(&self) -> u64 {
        SCHEMA_VERSION
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the session for `options`, building it on a miss.
    ///
    /// `Ok(None)` means the configuration could not be fingerprinted; the cause is logged and the
    /// cache is untouched. `Err` means building the session failed; the cache is left as it was and
    /// the next request retries from scratch.
    pub fn get_or_create(
        &self,
        options: &RepoOptions,
    ) -> Result<Option<Arc<dyn Session>>, SessionError> {
        let fingerprint = match ConfigFingerprint::derive(options, &self.inner.settings.storage) {
            Ok(fingerprint) => fingerprint,
            Err(err) => {
                tracing::error!(
                    target: "strata.sessions",
                    root = %options.root().display(),
                    query = %options.autoload.query,
                    trusted_db_path = %options.autoload.trusted_db_path,
                    error = %err,
                    "failed to derive session fingerprint"
                );
                return Ok(None);
            }
        };

        let session = {
            let mut state = self.inner.state.lock();
            let now = self.inner.clock.now();
            state.last_used.insert(fingerprint.clone(), now);
            if let Some(session) = state.sessions.get(&fingerprint) {
                return Ok(Some(Arc::clone(session)));
            }

            let recipe = self.inner.recipe(&fingerprint);
            match self.inner.builder.build(recipe) {
                Ok(session) => {
                    state
                        .sessions
                        .insert(fingerprint.clone(), Arc::clone(&session));
                    session
                }
                Err(err) => {
                    state.last_used.remove(&fingerprint);
                    tracing::warn!(
                        target: "strata.sessions",
                        fingerprint = %fingerprint,
                        error = %err,
                        "failed to build session"
                    );
                    return Err(err);
                }
            }
        };

        tracing::info!(
            target: "strata.sessions",
            fingerprint = %fingerprint,
            "created session"
        );
        self.schedule_idle_sweep();
        Ok(Some(session))
    }

    /// Closes and removes every session not used within `idle`. Returns how many were evicted.
    pub fn garbage_collect_idle(&self, idle: Duration) -> usize {
        self.inner.garbage_collect_idle(idle)
    }

    /// Closes and retires every session, then runs whatever deferred work is safe to run.
    pub fn shutdown(&self) -> usize {
        let sessions: Vec<_> = {
            let mut state = self.inner.state.lock();
            state.last_used.clear();
            state.sessions.drain().collect()
        };
        let count = sessions.len();
        for (fingerprint, session) in sessions {
            self.inner.close_and_retire(&fingerprint, session);
        }
        self.inner.treadmill.drain();
        if count > 0 {
            tracing::info!(target: "strata.sessions", sessions = count, "session factory shut down");
        }
        count
    }

    /// The store path the repository at `root` would use, without building a session.
    ///
    /// A relative `root` is resolved against `base`.
    pub fn db_path(&self, root: &Path, base: &Path) -> Result<PathBuf, FingerprintError> {
        let root = if root.is_relative() {
            base.join(root)
        } else {
            root.to_path_buf()
        };
        let options = RepoOptions::load_for_root(&root)?;
        let inputs = RepoStorageInputs {
            trusted_db_path: options.autoload.trusted_db_path.clone(),
            options_cache_key: options.cache_key(),
            cache_breaker: options.autoload.cache_breaker.clone(),
        };
        let identity = resolve_storage_identity(options.root(), &inputs, &self.inner.settings.storage)?;
        Ok(identity.path().to_path_buf())
    }

    fn schedule_idle_sweep(&self) {
        let inner: Weak<FactoryInner> = Arc::downgrade(&self.inner);
        let idle = self.inner.settings.idle_threshold;
        self.inner.treadmill.enqueue(move || {
            if let Some(inner) = inner.upgrade() {
                inner.garbage_collect_idle(idle);
            }
        });
    }
}

impl FactoryInner {
    fn recipe(&self, fingerprint: &ConfigFingerprint) -> SessionRecipe {
        let change_source = match fingerprint.storage() {
            StorageIdentity::ReadOnlyTrusted { .. } => None,
            StorageIdentity::WritableCreate { .. } | StorageIdentity::WritableExisting { .. } => {
                Some(select_change_source(
                    fingerprint.root(),
                    fingerprint.query(),
                    &self.watch_service,
                    self.settings.watch_retries,
                ))
            }
        };
        SessionRecipe {
            root: fingerprint.root().to_path_buf(),
            storage: fingerprint.storage().clone(),
            change_source,
            indexed_attributes: fingerprint.indexed_attributes().to_vec(),
            execution_mode: self.settings.execution_mode,
            update_suppression_path: self.settings.update_suppression_path.clone(),
            maintenance_interval: self.settings.maintenance_interval,
        }
    }

    fn garbage_collect_idle(&self, idle: Duration) -> usize {
        let evicted: Vec<(ConfigFingerprint, Arc<dyn Session>)> = {
            let mut state = self.state.lock();
            let cutoff = self.clock.now().checked_sub(idle);
            let is_idle = |last_used: Option<&Instant>| match last_used {
                None => true,
                Some(last_used) => cutoff.is_some_and(|cutoff| *last_used < cutoff),
            };

            let stale: Vec<ConfigFingerprint> = state
                .sessions
                .keys()
                .filter(|fingerprint| is_idle(state.last_used.get(*fingerprint)))
                .cloned()
                .collect();
            stale
                .into_iter()
                .filter_map(|fingerprint| {
                    state.last_used.remove(&fingerprint);
                    let session = state.sessions.remove(&fingerprint)?;
                    Some((fingerprint, session))
                })
                .collect()
        };

        let count = evicted.len();
        for (fingerprint, session) in evicted {
            tracing::info!(
                target: "strata.sessions",
                fingerprint = %fingerprint,
                "evicting idle session"
            );
            self.close_and_retire(&fingerprint, session);
        }
        count
    }

    fn close_and_retire(&self, fingerprint: &ConfigFingerprint, session: Arc<dyn Session>) {
        if let Err(err) = session.close() {
            tracing::warn!(
                target: "strata.sessions",
                fingerprint = %fingerprint,
                error = %err,
                "failed to close session"
            );
        }
        self.treadmill.retire(session);
    }
}

impl Drop for SessionFactory {
    fn drop(&mut self) {
        self.shutdown();
    }
}

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam_channel as channel;
use parking_lot::Mutex;

use crate::{CompiledQuery, WatchEvent, WatchMessage, WatchQuery};

/// A live subscription. Dropping it without calling [`Subscription::unsubscribe`] also ends it.
pub trait Subscription: Send {
    fn unsubscribe(&mut self);
}

/// A push-based file-watching service.
///
/// `subscribe` connects to the service for `root`. On success the service first delivers a
/// [`WatchEvent::Snapshot`] of every file selected by `query`, then [`WatchEvent::Changes`]
/// batches as files change, on `sink`. Delivery stops once the returned subscription is
/// unsubscribed or dropped.
pub trait WatchService: Send + Sync {
    fn subscribe(
        &self,
        root: &Path,
        query: &WatchQuery,
        compiled: &CompiledQuery,
        sink: channel::Sender<WatchMessage>,
    ) -> io::Result<Box<dyn Subscription>>;
}

impl<S: WatchService + ?Sized> WatchService for Arc<S> {
    fn subscribe(
        &self,
        root: &Path,
        query: &WatchQuery,
        compiled: &CompiledQuery,
        sink: channel::Sender<WatchMessage>,
    ) -> io::Result<Box<dyn Subscription>> {
        (**self).subscribe(root, query, compiled, sink)
    }
}

/// Deterministic [`WatchService`] for tests.
///
/// Nothing touches the OS: connection failures are scripted with
/// [`ManualWatchService::fail_next_connects`], the initial snapshot comes from
/// [`ManualWatchService::set_initial_files`], and changes are injected through
/// [`ManualWatchService::push`].
#[derive(Clone, Default)]
pub struct ManualWatchService {
    inner: Arc<Mutex<ManualState>>,
}

#[derive(Default)]
struct ManualState {
    failures: VecDeque<io::Error>,
    connect_attempts: usize,
    initial_files: Vec<PathBuf>,
    subscriptions: Vec<ManualSubscriptionState>,
}

struct ManualSubscriptionState {
    root: PathBuf,
    query: WatchQuery,
    sink: Option<channel::Sender<WatchMessage>>,
}

impl std::fmt::Debug for ManualWatchService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("ManualWatchService")
            .field("connect_attempts", &state.connect_attempts)
            .field("subscriptions", &state.subscriptions.len())
            .finish()
    }
}

impl ManualWatchService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        let mut state = self.inner.lock();
        for _ in 0..count {
            state.failures.push_back(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "watch service unavailable",
            ));
        }
    }

    /// Root-relative files reported in the snapshot of every later subscription (filtered by
    /// the subscription's query).
    pub fn set_initial_files(&self, files: impl IntoIterator<Item = impl Into<PathBuf>>) {
        self.inner.lock().initial_files = files.into_iter().map(Into::into).collect();
    }

    pub fn connect_attempts(&self) -> usize {
        self.inner.lock().connect_attempts
    }

    /// Number of subscriptions that have not been unsubscribed.
    pub fn active_subscriptions(&self) -> usize {
        self.inner
            .lock()
            .subscriptions
            .iter()
            .filter(|sub| sub.sink.is_some())
            .count()
    }

    /// Roots and queries of every subscription ever made, in order.
    pub fn subscriptions(&self) -> Vec<(PathBuf, WatchQuery)> {
        self.inner
            .lock()
            .subscriptions
            .iter()
            .map(|sub| (sub.root.clone(), sub.query.clone()))
            .collect()
    }

    /// Delivers `event` to every active subscription for `root`. Returns how many received it.
    pub fn push(&self, root: &Path, event: WatchEvent) -> usize {
        self.send(root, || Ok(event.clone()))
    }

    /// Delivers an asynchronous error to every active subscription for `root`.
    pub fn push_error(&self, root: &Path, kind: io::ErrorKind, message: &str) -> usize {
        self.send(root, || Err(io::Error::new(kind, message.to_owned())))
    }

    fn send(&self, root: &Path, make: impl Fn() -> WatchMessage) -> usize {
        let state = self.inner.lock();
        state
            .subscriptions
            .iter()
            .filter(|sub| sub.root == root)
            .filter_map(|sub| sub.sink.as_ref())
            .filter(|sink| sink.send(make()).is_ok())
            .count()
    }
}

impl WatchService for ManualWatchService {
    fn subscribe(
        &self,
        root: &Path,
        query: &WatchQuery,
        compiled: &CompiledQuery,
        sink: channel::Sender<WatchMessage>,
    ) -> io::Result<Box<dyn Subscription>> {
        let mut state = self.inner.lock();
        state.connect_attempts += 1;
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }

        let files: Vec<PathBuf> = state
            .initial_files
            .iter()
            .filter(|path| compiled.matches(path, false))
            .cloned()
            .collect();
        sink.send(Ok(WatchEvent::Snapshot { files }))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "watch receiver dropped"))?;

        let index = state.subscriptions.len();
        state.subscriptions.push(ManualSubscriptionState {
            root: root.to_path_buf(),
            query: query.clone(),
            sink: Some(sink),
        });
        Ok(Box::new(ManualSubscription {
            service: self.clone(),
            index,
            active: true,
        }))
    }
}

struct ManualSubscription {
    service: ManualWatchService,
    index: usize,
    active: bool,
}

impl Subscription for ManualSubscription {
    fn unsubscribe(&mut self) {
        if !std::mem::replace(&mut self.active, false) {
            return;
        }
        if let Some(sub) = self.service.inner.lock().subscriptions.get_mut(self.index) {
            sub.sink = None;
        }
    }
}

impl Drop for ManualSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

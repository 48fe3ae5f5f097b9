//! Change sources.
//!
//! A session learns about its repository's files from exactly one [`ChangeSource`], chosen once
//! when the session is built:
//!
//! - [`SubscriptionWatcher`]: a subscription to a push-based [`WatchService`] for the root,
//!   filtered by a [`WatchQuery`]. Connecting is retried a bounded number of times.
//! - [`StaticWatcher`]: a one-time crawl of the root restricted to
//!   [`CRAWL_EXTENSIONS`](crate::CRAWL_EXTENSIONS). It never reports changes afterwards.
//!
//! Both deliver [`WatchMessage`]s on a `crossbeam_channel` receiver so consumers can fold them
//! into their own event loops. The first event is always a [`WatchEvent::Snapshot`] of the
//! currently matching files.
//!
//! # Testing
//!
//! Avoid tests that depend on OS watcher timing. Use [`ManualWatchService`](crate::ManualWatchService)
//! to script connection failures and inject changes deterministically.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam_channel as channel;

use crate::change::FileChange;
use crate::crawl::{crawl_with_threshold, CRAWL_ADVISORY_THRESHOLD};
use crate::service::{Subscription, WatchService};
use crate::WatchQuery;

/// An event produced by a change source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// The complete set of matching root-relative files. Replaces any previously known set.
    Snapshot { files: Vec<PathBuf> },
    /// One or more normalized file changes.
    Changes { changes: Vec<FileChange> },
    /// The source dropped events; consumers should rescan the root.
    Rescan,
}

impl WatchEvent {
    /// The changes carried by this event. Empty for snapshots and rescans.
    pub fn changes(&self) -> &[FileChange] {
        match self {
            WatchEvent::Changes { changes } => changes,
            WatchEvent::Snapshot { .. } | WatchEvent::Rescan => &[],
        }
    }
}

/// Message type delivered by a change source. Sources may surface errors asynchronously on the
/// same stream.
pub type WatchMessage = io::Result<WatchEvent>;

const WATCH_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeSourceKind {
    Subscription,
    Static,
}

/// One-shot crawl of a repository root.
#[derive(Debug)]
pub struct StaticWatcher {
    root: PathBuf,
    threshold: usize,
    tx: Option<channel::Sender<WatchMessage>>,
    rx: channel::Receiver<WatchMessage>,
    started: bool,
}

impl StaticWatcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_threshold(root, CRAWL_ADVISORY_THRESHOLD)
    }

    /// Like [`StaticWatcher::new`] with a custom advisory threshold.
    pub fn with_threshold(root: impl Into<PathBuf>, threshold: usize) -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            root: root.into(),
            threshold,
            tx: Some(tx),
            rx,
            started: false,
        }
    }

    /// Crawls the root and queues the resulting snapshot. Later calls do nothing.
    pub fn start(&mut self) -> io::Result<()> {
        if self.started {
            return Ok(());
        }
        let report = crawl_with_threshold(&self.root, self.threshold)?;
        self.started = true;
        if let Some(tx) = &self.tx {
            let _ = tx.send(Ok(WatchEvent::Snapshot {
                files: report.files,
            }));
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        self.tx = None;
    }

    pub fn receiver(&self) -> &channel::Receiver<WatchMessage> {
        &self.rx
    }
}

/// Subscription to a [`WatchService`] for one root and query.
pub struct SubscriptionWatcher {
    root: PathBuf,
    query: WatchQuery,
    service: Arc<dyn WatchService>,
    retries: u32,
    tx: channel::Sender<WatchMessage>,
    rx: channel::Receiver<WatchMessage>,
    subscription: Option<Box<dyn Subscription>>,
}

impl std::fmt::Debug for SubscriptionWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionWatcher")
            .field("root", &self.root)
            .field("query", &self.query.canonical())
            .field("retries", &self.retries)
            .field("subscribed", &self.subscription.is_some())
            .finish()
    }
}

impl SubscriptionWatcher {
    pub fn new(
        root: impl Into<PathBuf>,
        query: WatchQuery,
        service: Arc<dyn WatchService>,
        retries: u32,
    ) -> Self {
        let (tx, rx) = channel::bounded(WATCH_QUEUE_CAPACITY);
        Self {
            root: root.into(),
            query,
            service,
            retries,
            tx,
            rx,
            subscription: None,
        }
    }

    pub fn query(&self) -> &WatchQuery {
        &self.query
    }

    /// Compiles the query and connects, making up to `1 + retries` attempts. Events still queued
    /// from an earlier subscription are discarded first.
    ///
    /// Fails with `InvalidInput` if the query uses an unsupported or malformed term, or with the
    /// last connection error once every attempt has failed.
    pub fn start(&mut self) -> io::Result<()> {
        if self.subscription.is_some() {
            return Ok(());
        }

        let compiled = self
            .query
            .compile()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

        // The subscription's snapshot supersedes anything still queued, and the queue is bounded.
        let stale = self.rx.try_iter().count();
        if stale > 0 {
            tracing::debug!(
                target: "strata.vfs",
                root = %self.root.display(),
                stale,
                "discarded queued events before resubscribing"
            );
        }

        let attempts = self.retries.saturating_add(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self
                .service
                .subscribe(&self.root, &self.query, &compiled, self.tx.clone())
            {
                Ok(subscription) => {
                    tracing::info!(
                        target: "strata.vfs",
                        root = %self.root.display(),
                        query = %self.query,
                        attempt,
                        "subscribed to watch service"
                    );
                    self.subscription = Some(subscription);
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(
                        target: "strata.vfs",
                        root = %self.root.display(),
                        attempt,
                        attempts,
                        error = %err,
                        "failed to subscribe to watch service"
                    );
                    last_error = Some(err);
                }
            }
        }

        let err = last_error.unwrap_or_else(|| io::Error::other("no subscription attempt made"));
        Err(io::Error::new(
            err.kind(),
            format!(
                "failed to subscribe to {} after {attempts} attempt(s): {err}",
                self.root.display()
            ),
        ))
    }

    pub fn stop(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }

    pub fn receiver(&self) -> &channel::Receiver<WatchMessage> {
        &self.rx
    }
}

impl Drop for SubscriptionWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The change source a session was built with.
#[derive(Debug)]
pub enum ChangeSource {
    Subscription(SubscriptionWatcher),
    Static(StaticWatcher),
}

impl ChangeSource {
    pub fn kind(&self) -> ChangeSourceKind {
        match self {
            ChangeSource::Subscription(_) => ChangeSourceKind::Subscription,
            ChangeSource::Static(_) => ChangeSourceKind::Static,
        }
    }

    pub fn root(&self) -> &Path {
        match self {
            ChangeSource::Subscription(watcher) => &watcher.root,
            ChangeSource::Static(watcher) => &watcher.root,
        }
    }

    pub fn start(&mut self) -> io::Result<()> {
        match self {
            ChangeSource::Subscription(watcher) => watcher.start(),
            ChangeSource::Static(watcher) => watcher.start(),
        }
    }

    pub fn stop(&mut self) {
        match self {
            ChangeSource::Subscription(watcher) => watcher.stop(),
            ChangeSource::Static(watcher) => watcher.stop(),
        }
    }

    pub fn receiver(&self) -> &channel::Receiver<WatchMessage> {
        match self {
            ChangeSource::Subscription(watcher) => watcher.receiver(),
            ChangeSource::Static(watcher) => watcher.receiver(),
        }
    }

    /// Drains every pending event without blocking. Stops at the first error.
    pub fn poll(&mut self) -> io::Result<Vec<WatchEvent>> {
        let mut out = Vec::new();
        for msg in self.receiver().try_iter() {
            out.push(msg?);
        }
        Ok(out)
    }
}

/// Picks the change source for `root`: a subscription when a query is configured, a static crawl
/// otherwise. The source is not started.
pub fn select_change_source(
    root: &Path,
    query: Option<&WatchQuery>,
    service: &Arc<dyn WatchService>,
    retries: u32,
) -> ChangeSource {
    match query {
        Some(query) => ChangeSource::Subscription(SubscriptionWatcher::new(
            root,
            query.clone(),
            Arc::clone(service),
            retries,
        )),
        None => ChangeSource::Static(StaticWatcher::new(root)),
    }
}

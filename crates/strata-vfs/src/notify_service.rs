//! [`WatchService`](crate::WatchService) backed by the OS file watcher (`notify`).
//!
//! Raw events are normalized into [`FileChange`]s (pairing rename halves where possible),
//! made relative to the subscribed root and filtered by the subscription's query. The callback
//! and consumer queues are bounded; on overflow the pending raw events are discarded and a single
//! [`WatchEvent::Rescan`] is delivered instead.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use notify::EventKind;

use crate::change::FileChange;

fn notify_event_requests_rescan(event: &notify::Event) -> bool {
    matches!(event.attrs.flag(), Some(notify::event::Flag::Rescan))
        || (matches!(event.kind, EventKind::Other) && event.paths.is_empty())
}

/// Turns raw `notify` events into [`FileChange`]s with absolute paths.
#[derive(Debug, Default)]
pub struct EventNormalizer {
    pending_renames: VecDeque<(Instant, PathBuf)>,
}

impl EventNormalizer {
    pub const MAX_AGE: Duration = Duration::from_secs(2);
    pub const MAX_PENDING_RENAMES: usize = 512;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: notify::Event, now: Instant) -> Vec<FileChange> {
        use notify::event::{ModifyKind, RenameMode};

        let mut out = self.gc_pending(now);
        match event.kind {
            EventKind::Create(_) => out.extend(
                event
                    .paths
                    .into_iter()
                    .map(|path| FileChange::Created { path }),
            ),
            EventKind::Remove(_) => out.extend(
                event
                    .paths
                    .into_iter()
                    .map(|path| FileChange::Deleted { path }),
            ),
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                out.extend(paths_to_moves(event.paths))
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                for path in event.paths {
                    self.pending_renames.push_back((now, path));
                }
                out.extend(self.gc_pending(now));
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                for to in event.paths {
                    match self.pending_renames.pop_front() {
                        Some((_, from)) => out.push(FileChange::Moved { from, to }),
                        None => out.push(FileChange::Created { path: to }),
                    }
                }
            }
            _ => out.extend(
                event
                    .paths
                    .into_iter()
                    .map(|path| FileChange::Modified { path }),
            ),
        }
        out
    }

    /// Flushes expired rename halves as deletions.
    pub fn flush(&mut self, now: Instant) -> Vec<FileChange> {
        self.gc_pending(now)
    }

    pub fn flush_all_pending_renames_as_deleted(&mut self) -> Vec<FileChange> {
        self.pending_renames
            .drain(..)
            .map(|(_, path)| FileChange::Deleted { path })
            .collect()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending_renames
            .front()
            .map(|(started_at, _)| *started_at + Self::MAX_AGE)
    }

    fn gc_pending(&mut self, now: Instant) -> Vec<FileChange> {
        let mut out = Vec::new();
        while let Some((t, _)) = self.pending_renames.front() {
            if now.saturating_duration_since(*t) <= Self::MAX_AGE {
                break;
            }
            if let Some((_, path)) = self.pending_renames.pop_front() {
                out.push(FileChange::Deleted { path });
            }
        }
        while self.pending_renames.len() > Self::MAX_PENDING_RENAMES {
            if let Some((_, path)) = self.pending_renames.pop_front() {
                out.push(FileChange::Deleted { path });
            }
        }
        out
    }
}

fn paths_to_moves(paths: Vec<PathBuf>) -> Vec<FileChange> {
    let mut out = Vec::new();
    let mut it = paths.into_iter();
    while let Some(from) = it.next() {
        let Some(to) = it.next() else {
            out.push(FileChange::Modified { path: from });
            break;
        };
        out.push(FileChange::Moved { from, to });
    }
    out
}

/// Rewrites absolute changes relative to `root`, keeping only paths selected by `accept`.
///
/// A move whose destination is dropped becomes a deletion; one whose source is dropped becomes a
/// creation.
pub(crate) fn relativize(
    root: &Path,
    changes: Vec<FileChange>,
    accept: impl Fn(&Path) -> bool,
) -> Vec<FileChange> {
    let rel = |path: &Path| {
        path.strip_prefix(root)
            .ok()
            .filter(|relative| accept(relative))
            .map(Path::to_path_buf)
    };

    changes
        .into_iter()
        .filter_map(|change| match change {
            FileChange::Created { path } => rel(&path).map(|path| FileChange::Created { path }),
            FileChange::Modified { path } => rel(&path).map(|path| FileChange::Modified { path }),
            FileChange::Deleted { path } => rel(&path).map(|path| FileChange::Deleted { path }),
            FileChange::Moved { from, to } => match (rel(&from), rel(&to)) {
                (Some(from), Some(to)) => Some(FileChange::Moved { from, to }),
                (Some(path), None) => Some(FileChange::Deleted { path }),
                (None, Some(path)) => Some(FileChange::Created { path }),
                (None, None) => None,
            },
        })
        .collect()
}

#[cfg(feature = "watch-notify")]
pub use service::NotifyWatchService;

#[cfg(feature = "watch-notify")]
mod service {
    use std::io;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use crossbeam_channel as channel;
    use notify::{RecursiveMode, Watcher};

    use super::{notify_event_requests_rescan, relativize, EventNormalizer};
    use crate::crawl::walk_files;
    use crate::service::{Subscription, WatchService};
    use crate::{CompiledQuery, WatchEvent, WatchMessage, WatchQuery};

    const RAW_QUEUE_CAPACITY: usize = 4096;
    const OVERFLOW_RETRY_INTERVAL: Duration = Duration::from_millis(50);

    /// Watches roots with the platform's recommended `notify` backend.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct NotifyWatchService;

    impl NotifyWatchService {
        pub fn new() -> Self {
            Self
        }
    }

    fn notify_error_to_io(err: notify::Error) -> io::Error {
        io::Error::other(err)
    }

    fn try_send_or_overflow<T>(tx: &channel::Sender<T>, overflowed: &AtomicBool, msg: T) {
        if let Err(channel::TrySendError::Full(_)) = tx.try_send(msg) {
            overflowed.store(true, Ordering::Release);
        }
    }

    impl WatchService for NotifyWatchService {
        fn subscribe(
            &self,
            root: &Path,
            query: &WatchQuery,
            compiled: &CompiledQuery,
            sink: channel::Sender<WatchMessage>,
        ) -> io::Result<Box<dyn Subscription>> {
            let (raw_tx, raw_rx) = channel::bounded(RAW_QUEUE_CAPACITY);
            let (stop_tx, stop_rx) = channel::bounded::<()>(0);
            let overflowed = Arc::new(AtomicBool::new(false));

            let overflowed_cb = Arc::clone(&overflowed);
            let mut watcher = notify::recommended_watcher(move |res| {
                try_send_or_overflow(&raw_tx, overflowed_cb.as_ref(), res);
            })
            .map_err(notify_error_to_io)?;
            watcher
                .watch(root, RecursiveMode::Recursive)
                .map_err(notify_error_to_io)?;

            let snapshot = walk_files(root, |path, is_dir| compiled.matches(path, is_dir))?;
            sink.send(Ok(WatchEvent::Snapshot {
                files: snapshot.files,
            }))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "watch receiver dropped"))?;

            let drain = Drain {
                root: root.to_path_buf(),
                compiled: compiled.clone(),
                raw_rx,
                sink,
                stop_rx,
                overflowed,
            };
            let thread = std::thread::Builder::new()
                .name("strata-notify-drain".to_string())
                .spawn(move || drain.run())?;

            tracing::debug!(
                target: "strata.vfs",
                root = %root.display(),
                query = %query,
                "notify subscription started"
            );

            Ok(Box::new(NotifySubscription {
                watcher: Some(watcher),
                stop_tx,
                thread: Some(thread),
            }))
        }
    }

    struct Drain {
        root: PathBuf,
        compiled: CompiledQuery,
        raw_rx: channel::Receiver<notify::Result<notify::Event>>,
        sink: channel::Sender<WatchMessage>,
        stop_rx: channel::Receiver<()>,
        overflowed: Arc<AtomicBool>,
    }

    impl Drain {
        fn run(self) {
            let mut normalizer = EventNormalizer::new();

            loop {
                if self.overflowed.load(Ordering::Acquire) {
                    normalizer = EventNormalizer::new();
                    while self.raw_rx.try_recv().is_ok() {}
                    match self.sink.try_send(Ok(WatchEvent::Rescan)) {
                        Ok(()) => self.overflowed.store(false, Ordering::Release),
                        Err(channel::TrySendError::Full(_)) => {}
                        Err(channel::TrySendError::Disconnected(_)) => break,
                    }
                }

                let tick = if self.overflowed.load(Ordering::Acquire) {
                    channel::after(OVERFLOW_RETRY_INTERVAL)
                } else {
                    match normalizer.next_deadline() {
                        Some(deadline) => {
                            channel::after(deadline.saturating_duration_since(Instant::now()))
                        }
                        None => channel::never(),
                    }
                };

                channel::select! {
                    recv(self.stop_rx) -> _ => {
                        let changes = normalizer.flush_all_pending_renames_as_deleted();
                        self.forward(changes);
                        break;
                    },
                    recv(self.raw_rx) -> msg => {
                        let Ok(res) = msg else {
                            let changes = normalizer.flush_all_pending_renames_as_deleted();
                            self.forward(changes);
                            break;
                        };
                        match res {
                            Ok(event) if notify_event_requests_rescan(&event) => {
                                self.overflowed.store(true, Ordering::Release);
                            }
                            Ok(event) => {
                                let changes = normalizer.push(event, Instant::now());
                                if !self.forward(changes) {
                                    break;
                                }
                            }
                            Err(err) => {
                                self.overflowed.store(true, Ordering::Release);
                                if let Err(channel::TrySendError::Disconnected(_)) =
                                    self.sink.try_send(Err(notify_error_to_io(err)))
                                {
                                    break;
                                }
                            }
                        }
                    },
                    recv(tick) -> _ => {
                        let changes = normalizer.flush(Instant::now());
                        if !self.forward(changes) {
                            break;
                        }
                    },
                }
            }
        }

        /// Returns `false` once the consumer is gone.
        fn forward(&self, changes: Vec<crate::FileChange>) -> bool {
            let changes = relativize(&self.root, changes, |path| {
                let is_dir = self.root.join(path).is_dir();
                !is_dir && self.compiled.matches(path, false)
            });
            if changes.is_empty() {
                return true;
            }
            match self.sink.try_send(Ok(WatchEvent::Changes { changes })) {
                Ok(()) => true,
                Err(channel::TrySendError::Full(_)) => {
                    self.overflowed.store(true, Ordering::Release);
                    true
                }
                Err(channel::TrySendError::Disconnected(_)) => false,
            }
        }
    }

    struct NotifySubscription {
        watcher: Option<notify::RecommendedWatcher>,
        stop_tx: channel::Sender<()>,
        thread: Option<std::thread::JoinHandle<()>>,
    }

    impl Subscription for NotifySubscription {
        fn unsubscribe(&mut self) {
            // Dropping the watcher disconnects the raw queue; the stop signal covers a drain
            // thread that is blocked elsewhere.
            self.watcher = None;
            let _ = self.stop_tx.try_send(());
            if let Some(thread) = self.thread.take() {
                if thread.join().is_err() {
                    tracing::debug!(target: "strata.vfs", "notify drain thread panicked");
                }
            }
        }
    }

    impl Drop for NotifySubscription {
        fn drop(&mut self) {
            self.unsubscribe();
        }
    }
}

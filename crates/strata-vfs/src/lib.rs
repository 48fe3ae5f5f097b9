//! File discovery and change delivery for indexed repositories.
//!
//! A session learns about its files from a [`ChangeSource`]:
//! - [`SubscriptionWatcher`] subscribes to a push-based [`WatchService`] with a [`WatchQuery`]
//!   and receives an initial snapshot followed by change batches.
//! - [`StaticWatcher`] performs a one-shot [`crawl`] and never reports changes afterwards.
//!
//! [`select_change_source`] picks between the two based on whether the repository configured a
//! watch query.

mod change;
mod crawl;
#[cfg(any(test, feature = "watch-notify"))]
mod notify_service;
mod query;
mod service;
mod watch;

pub use change::FileChange;
pub use crawl::{crawl, crawl_with_threshold, CrawlReport, CRAWL_ADVISORY_THRESHOLD, CRAWL_EXTENSIONS};
pub use query::{CompiledQuery, QueryError, WatchQuery};
pub use service::{ManualWatchService, Subscription, WatchService};
pub use watch::{
    select_change_source, ChangeSource, ChangeSourceKind, StaticWatcher, SubscriptionWatcher,
    WatchEvent, WatchMessage,
};

#[cfg(feature = "watch-notify")]
pub use notify_service::{EventNormalizer, NotifyWatchService};

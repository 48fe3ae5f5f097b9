//! The session cache.
//!
//! [`SessionFactory`] keeps at most one live [`Session`] per [`ConfigFingerprint`]: sessions are
//! built on first request, shared by every later request with the same effective configuration,
//! and evicted once idle. Eviction closes the session outside the cache lock and hands the cache's
//! reference to a [`Treadmill`](strata_scheduler::Treadmill) so it is only dropped after in-flight
//! requests finish.

mod clock;
mod error;
mod factory;
mod fingerprint;
mod session;
mod settings;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{FingerprintError, SessionError};
pub use factory::{SessionFactory, SessionFactoryBuilder};
pub use fingerprint::ConfigFingerprint;
pub use session::{DefaultSessionBuilder, IndexSession, Session, SessionBuilder, SessionRecipe};
pub use settings::SessionSettings;

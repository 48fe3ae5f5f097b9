//! Deferred work for strata.
//!
//! Sessions are shared between the session cache and any number of in-flight requests. Removing a
//! session from the cache must not free it while a request that started earlier may still be
//! using it, so final releases (and other housekeeping such as idle sweeps) are handed to a
//! [`Treadmill`], which runs them once every request that was in flight at enqueue time has
//! finished.
//!
//! The treadmill does not own any threads. Jobs run on whichever thread reaches a safe point:
//! the thread that enqueues while no older request is in flight, the thread whose
//! [`RequestGuard`] is dropped last, or an explicit [`Treadmill::drain`] call.

mod panic;
mod treadmill;

pub use panic::panic_payload_to_str;
pub use treadmill::{RequestGuard, Treadmill};

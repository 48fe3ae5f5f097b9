use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::panic_payload_to_str;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct State {
    /// Stamp given to the next enqueued job. Requests started afterwards observe a larger epoch.
    epoch: u64,
    /// Number of live requests per start epoch.
    in_flight: BTreeMap<u64, usize>,
    /// Jobs in enqueue order, tagged with their stamp.
    pending: VecDeque<(u64, Job)>,
}

impl State {
    fn pop_runnable(&mut self) -> Option<Job> {
        let oldest_request = self.in_flight.keys().next().copied();
        let (stamp, _) = self.pending.front()?;
        if oldest_request.is_some_and(|oldest| oldest <= *stamp) {
            return None;
        }
        self.pending.pop_front().map(|(_, job)| job)
    }
}

/// Request-epoch based deferred reclamation.
///
/// Every request brackets its work with [`Treadmill::start_request`]. A job enqueued while
/// requests are in flight is held back until all of those requests have finished; requests that
/// start after the enqueue do not delay it.
#[derive(Clone, Default)]
pub struct Treadmill {
    inner: Arc<Mutex<State>>,
}

impl std::fmt::Debug for Treadmill {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("Treadmill")
            .field("epoch", &state.epoch)
            .field("in_flight", &state.in_flight.values().sum::<usize>())
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl Treadmill {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the start of a request. Deferred jobs enqueued from now on wait for the returned
    /// guard to be dropped.
    pub fn start_request(&self) -> RequestGuard {
        let mut state = self.inner.lock();
        let epoch = state.epoch;
        *state.in_flight.entry(epoch).or_insert(0) += 1;
        RequestGuard {
            treadmill: self.clone(),
            epoch,
        }
    }

    /// Queue `job` and run whatever is already safe to run.
    pub fn enqueue<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.inner.lock();
            let stamp = state.epoch;
            state.pending.push_back((stamp, Box::new(job)));
            state.epoch += 1;
        }
        self.drain();
    }

    /// Drop `value` once every request currently in flight has finished.
    pub fn retire<T>(&self, value: T)
    where
        T: Send + 'static,
    {
        self.enqueue(move || drop(value));
    }

    /// Runs every job whose preceding requests have all completed. Returns the number of jobs run.
    ///
    /// Jobs run on the calling thread with the internal lock released, so a job may itself
    /// enqueue more work.
    pub fn drain(&self) -> usize {
        let mut ran = 0;
        loop {
            let Some(job) = self.inner.lock().pop_runnable() else {
                break;
            };
            run_job(job);
            ran += 1;
        }
        ran
    }

    pub fn pending_jobs(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn in_flight_requests(&self) -> usize {
        self.inner.lock().in_flight.values().sum()
    }

    fn finish_request(&self, epoch: u64) {
        {
            let mut state = self.inner.lock();
            if let Some(count) = state.in_flight.get_mut(&epoch) {
                *count -= 1;
                if *count == 0 {
                    state.in_flight.remove(&epoch);
                }
            }
        }
        self.drain();
    }
}

fn run_job(job: Job) {
    if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
        tracing::error!(
            target: "strata.scheduler",
            panic = %panic_payload_to_str(&*panic),
            "deferred job panicked"
        );
    }
}

/// Keeps deferred jobs enqueued after its creation from running until it is dropped.
#[must_use = "dropping the guard immediately ends the request"]
pub struct RequestGuard {
    treadmill: Treadmill,
    epoch: u64,
}

impl std::fmt::Debug for RequestGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestGuard")
            .field("epoch", &self.epoch)
            .finish()
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.treadmill.finish_request(self.epoch);
    }
}

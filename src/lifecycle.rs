//! Lifecycle state and the optional queue-statistics sampler (component E).
//!
//! `State` gates admission: the Task Router only accepts new tasks while
//! `Open`. The sampler is a single background thread that calls a caller-
//! supplied closure once a second (sleep, do the periodic thing, check a
//! stop flag, repeat), generalized from "flush dirty pages" to "fold one
//! telemetry sample into the EWMAs."

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Monotonic lifecycle state: `Open` -> `Draining` -> `Closed`. Never
/// moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Open,
    Draining,
    Closed,
}

struct SamplerHandle {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub(crate) struct Lifecycle {
    state: Mutex<State>,
    sampler: Mutex<Option<SamplerHandle>>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State::Open),
            sampler: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> State {
        *self.state.lock().unwrap()
    }

    pub(crate) fn is_admitting(&self) -> bool {
        self.state() == State::Open
    }

    /// `Open` -> `Draining`. No-op once already draining or closed.
    pub(crate) fn begin_draining(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == State::Open {
            *state = State::Draining;
        }
    }

    pub(crate) fn close(&self) {
        *self.state.lock().unwrap() = State::Closed;
    }

    /// Start the `collectQueueStatistics` sampler. `sample` is called
    /// roughly once a second until `stop_sampler` is called; it should be
    /// cheap (just atomic loads and one `Ewma::tick`).
    pub(crate) fn start_sampler(&self, sample: impl Fn() + Send + 'static) {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            while !stop_for_thread.load(Ordering::Acquire) {
                sample();
                thread::sleep(Duration::from_secs(1));
            }
        });
        *self.sampler.lock().unwrap() = Some(SamplerHandle { stop, handle });
    }

    pub(crate) fn stop_sampler(&self) {
        if let Some(sampler) = self.sampler.lock().unwrap().take() {
            sampler.stop.store(true, Ordering::Release);
            let _ = sampler.handle.join();
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn state_advances_monotonically() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), State::Open);
        lifecycle.begin_draining();
        assert_eq!(lifecycle.state(), State::Draining);
        lifecycle.close();
        assert_eq!(lifecycle.state(), State::Closed);
        // draining after close does not resurrect admission
        lifecycle.begin_draining();
        assert_eq!(lifecycle.state(), State::Closed);
    }

    #[test]
    fn sampler_calls_closure_and_stops_cleanly() {
        let lifecycle = Lifecycle::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks_for_sampler = Arc::clone(&ticks);
        lifecycle.start_sampler(move || {
            ticks_for_sampler.fetch_add(1, Ordering::Relaxed);
        });
        thread::sleep(Duration::from_millis(50));
        lifecycle.stop_sampler();
        assert!(ticks.load(Ordering::Relaxed) >= 1);
    }
}

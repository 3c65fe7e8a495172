//! Cancellation shared by the polling loops.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// A one-shot stop flag whose waiters wake up as soon as it is raised.
#[derive(Debug, Clone, Default)]
pub(crate) struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Raises the flag and wakes every sleeping loop.
    pub(crate) fn stop(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock().unwrap_or_else(|e| e.into_inner()) = true;
        cvar.notify_all();
    }

    pub(crate) fn is_stopped(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sleeps for `duration` unless stopped first.
    ///
    /// Returns `true` if the full duration elapsed, `false` if the signal was
    /// raised before or during the sleep.
    pub(crate) fn sleep(&self, duration: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let deadline = Instant::now() + duration;
        let mut stopped = flag.lock().unwrap_or_else(|e| e.into_inner());
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            stopped = match cvar.wait_timeout(stopped, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
        false
    }
}

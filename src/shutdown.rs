use std::{
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

/// Process-wide cancellation token.
///
/// Clones share the same state. Long running loops check [`Shutdown::is_triggered`]
/// between iterations and use [`Shutdown::sleep`] instead of `thread::sleep` so that
/// a shutdown request wakes them immediately.
#[derive(Clone, Default, Debug)]
pub struct Shutdown {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let (lock, cvar) = &*self.inner;
        let mut triggered = lock.lock().unwrap_or_else(|e| e.into_inner());
        *triggered = true;
        cvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sleeps for `duration` or until shutdown is triggered. Returns `true` if shutdown
    /// was triggered.
    pub fn sleep(&self, duration: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let deadline = Instant::now() + duration;
        let mut triggered = lock.lock().unwrap_or_else(|e| e.into_inner());
        while !*triggered {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            triggered = match cvar.wait_timeout(triggered, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
        *triggered
    }
}

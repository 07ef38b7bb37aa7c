use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::worker::runner::{Waker, lock};

/// Manual-reset event: stays set until explicitly cleared, waking every waiter.
#[derive(Debug, Clone, Default)]
pub struct ManualResetEvent {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ManualResetEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let (flag, cond) = &*self.inner;
        *lock(flag) = true;
        cond.notify_all();
    }

    pub fn clear(&self) {
        *lock(&self.inner.0) = false;
    }

    pub fn is_set(&self) -> bool {
        *lock(&self.inner.0)
    }

    /// Block until set or `timeout` elapses; returns whether the event is set.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (flag, cond) = &*self.inner;
        let guard = lock(flag);
        let (guard, _) = cond
            .wait_timeout_while(guard, timeout, |set| !*set)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard
    }

    pub fn waker(&self) -> Waker {
        let event = self.clone();
        Box::new(move || event.set())
    }
}

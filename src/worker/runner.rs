//! The shutdown protocol shared by every threaded component.
//!
//! Stopping is always cooperative: clear the run flag, wake the thread if it
//! is parked (poison pill or signal), then wait a bounded time for it to exit.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::worker::queue::{BoundedQueue, Recv};
use crate::worker::signal::ManualResetEvent;

/// Wakes a thread blocked on its input so it can observe the cleared run flag.
pub type Waker = Box<dyn Fn() + Send + Sync>;

/// Shared "keep going" flag, set until the owner asks the thread to stop.
#[derive(Debug, Clone)]
pub struct RunFlag(Arc<AtomicBool>);

impl Default for RunFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl RunFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Poll and backoff intervals for the worker loops.
#[derive(Debug, Clone, Copy)]
pub struct LoopTiming {
    pub poll_interval: Duration,
    pub error_backoff: Duration,
}

impl From<&WorkerConfig> for LoopTiming {
    fn from(cfg: &WorkerConfig) -> Self {
        Self {
            poll_interval: cfg.poll_interval(),
            error_backoff: cfg.error_backoff(),
        }
    }
}

/// A named OS thread with a run flag, an optional waker and a bounded join.
pub struct WorkerThread {
    name: String,
    running: RunFlag,
    waker: Option<Waker>,
    handle: Option<JoinHandle<()>>,
    exited: Receiver<()>,
}

impl WorkerThread {
    pub fn spawn<F>(
        name: impl Into<String>,
        running: RunFlag,
        waker: Option<Waker>,
        body: F,
    ) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        // Never sent on; disconnects when the thread finishes, even by unwinding.
        let (exit_tx, exited) = crossbeam_channel::bounded::<()>(0);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _exit = exit_tx;
                body();
            })
            .map_err(|source| Error::Spawn {
                name: name.clone(),
                source,
            })?;
        debug!(thread = %name, "thread started");

        Ok(Self {
            name,
            running,
            waker,
            handle: Some(handle),
            exited,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Returns `true` if the thread exited within `timeout`. A thread that does
    /// not is detached and left to finish on its own.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        self.running.stop();
        if let Some(wake) = &self.waker {
            wake();
        }
        let Some(handle) = self.handle.take() else {
            return true;
        };

        match self.exited.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    warn!(thread = %self.name, "thread exited by panic");
                }
                info!(thread = %self.name, "thread stopped");
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(thread = %self.name, ?timeout, "thread did not stop in time, detaching");
                false
            }
        }
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop(Duration::from_millis(200));
        }
    }
}

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Run one step, turning errors and panics into a log line plus a short pause.
pub(crate) fn guarded_step<F>(name: &str, backoff: Duration, step: F)
where
    F: FnOnce() -> Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(step)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(worker = name, error = %e, "processing step failed");
            thread::sleep(backoff);
        }
        Err(payload) => {
            let panic = panic_message(payload.as_ref());
            error!(worker = name, panic, "processing step panicked");
            thread::sleep(backoff);
        }
    }
}

/// Consume `queue` until stopped. `step` receives `Some(item)` for each item
/// and `None` whenever a poll interval passes with nothing to do.
pub fn run_consumer_loop<T, F>(
    name: &str,
    queue: &BoundedQueue<T>,
    running: &RunFlag,
    timing: LoopTiming,
    mut step: F,
) where
    F: FnMut(Option<T>) -> Result<()>,
{
    while running.is_running() {
        match queue.get(timing.poll_interval) {
            Recv::Item(item) => guarded_step(name, timing.error_backoff, || step(Some(item))),
            Recv::Timeout => guarded_step(name, timing.error_backoff, || step(None)),
            Recv::Stopped => break,
        }
    }
    debug!(worker = name, "consumer loop exited");
}

/// Call `step` every `period` until stopped.
pub fn run_polling_loop<F>(
    name: &str,
    running: &RunFlag,
    period: Duration,
    timing: LoopTiming,
    mut step: F,
) where
    F: FnMut() -> Result<()>,
{
    while running.is_running() {
        guarded_step(name, timing.error_backoff, &mut step);
        thread::sleep(period);
    }
    debug!(worker = name, "polling loop exited");
}

/// Call `step` each time `signal` is raised, until stopped. The signal is
/// cleared before the step runs so a raise during the step is not lost.
pub fn run_signal_loop<F>(
    name: &str,
    signal: &ManualResetEvent,
    running: &RunFlag,
    timing: LoopTiming,
    mut step: F,
) where
    F: FnMut() -> Result<()>,
{
    while running.is_running() {
        if !signal.wait(timing.poll_interval) || !running.is_running() {
            continue;
        }
        signal.clear();
        guarded_step(name, timing.error_backoff, &mut step);
    }
    debug!(worker = name, "signal loop exited");
}

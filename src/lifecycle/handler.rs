//! Threaded front end of the object registry.
//!
//! All registry mutation and all snapshot reads go through one mutex; readers
//! only ever receive deep copies. A condition variable tracks the update
//! generation so readers can block for fresh data.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use crate::config::{LifecycleConfig, WorkerConfig};
use crate::error::{Error, Result};
use crate::ids::IdSequence;
use crate::lifecycle::object::{ObjectResult, ObjectState};
use crate::lifecycle::registry::ObjectRegistry;
use crate::lifecycle::sink::{LifecycleNotification, LifecycleSink, SinkDispatcher};
use crate::tracker::{SourceId, TrackingBatch};
use crate::worker::{
    BoundedQueue, LoopTiming, ManualResetEvent, RunFlag, WorkerThread, lock, run_consumer_loop,
};

/// Read access to lifecycle registries.
pub trait ObjectSnapshots: Send + Sync {
    fn snapshot(&self, kind: ObjectState, source_id: Option<SourceId>) -> Vec<ObjectResult>;
}

struct RegistryState {
    registry: ObjectRegistry,
    generation: u64,
}

struct Shared {
    state: Mutex<RegistryState>,
    updated: Condvar,
    listeners: Mutex<Vec<ManualResetEvent>>,
    dispatcher: Option<SinkDispatcher>,
}

/// Cloneable reader/writer handle onto the shared registry.
#[derive(Clone)]
pub struct LifecycleHandle {
    shared: Arc<Shared>,
}

impl LifecycleHandle {
    /// Apply one batch inside the critical section, then wake readers and
    /// forward notifications to the sink outside it.
    pub fn process(&self, batch: &TrackingBatch) -> Vec<LifecycleNotification> {
        let notifications = {
            let mut state = lock(&self.shared.state);
            let notifications = state.registry.apply(batch);
            state.generation += 1;
            // Listeners are raised before any waiter can observe the new generation.
            for listener in lock(&self.shared.listeners).iter() {
                listener.set();
            }
            notifications
        };
        self.shared.updated.notify_all();
        if let Some(dispatcher) = &self.shared.dispatcher {
            dispatcher.dispatch(notifications.clone());
        }
        notifications
    }

    pub fn snapshot(&self, kind: ObjectState, source_id: Option<SourceId>) -> Vec<ObjectResult> {
        lock(&self.shared.state).registry.snapshot(kind, source_id)
    }

    pub fn count(&self, kind: ObjectState) -> usize {
        lock(&self.shared.state).registry.count(kind)
    }

    /// Number of batches applied so far.
    pub fn generation(&self) -> u64 {
        lock(&self.shared.state).generation
    }

    /// Block until a batch newer than `after` has been applied or `timeout`
    /// passes. Returns the current generation.
    pub fn wait_for_update(&self, after: u64, timeout: Duration) -> u64 {
        let guard = lock(&self.shared.state);
        let (guard, _) = self
            .shared
            .updated
            .wait_timeout_while(guard, timeout, |s| s.generation <= after)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.generation
    }

    /// Raise `event` after every applied batch.
    pub fn subscribe(&self, event: ManualResetEvent) {
        lock(&self.shared.listeners).push(event);
    }

    pub fn memory_bytes(&self) -> usize {
        lock(&self.shared.state).registry.memory_bytes()
    }

    pub fn drain_dead_letters(&self) -> Vec<LifecycleNotification> {
        self.shared
            .dispatcher
            .as_ref()
            .map(SinkDispatcher::drain_dead_letters)
            .unwrap_or_default()
    }
}

impl ObjectSnapshots for LifecycleHandle {
    fn snapshot(&self, kind: ObjectState, source_id: Option<SourceId>) -> Vec<ObjectResult> {
        LifecycleHandle::snapshot(self, kind, source_id)
    }
}

/// Object lifecycle stage: a bounded input queue drained by one consumer thread.
pub struct LifecycleHandler {
    handle: LifecycleHandle,
    input: BoundedQueue<TrackingBatch>,
    thread: Option<WorkerThread>,
    workers: WorkerConfig,
}

impl LifecycleHandler {
    pub fn new(config: LifecycleConfig, workers: &WorkerConfig) -> Self {
        Self::build(config, workers, None, Arc::new(IdSequence::new()))
    }

    pub fn with_sink(
        config: LifecycleConfig,
        workers: &WorkerConfig,
        sink: Arc<dyn LifecycleSink>,
    ) -> Self {
        let dispatcher =
            SinkDispatcher::new(sink, config.sink_retries, config.dead_letter_capacity);
        Self::build(config, workers, Some(dispatcher), Arc::new(IdSequence::new()))
    }

    fn build(
        config: LifecycleConfig,
        workers: &WorkerConfig,
        dispatcher: Option<SinkDispatcher>,
        ids: Arc<IdSequence>,
    ) -> Self {
        let shared = Shared {
            state: Mutex::new(RegistryState {
                registry: ObjectRegistry::with_id_sequence(config, ids),
                generation: 0,
            }),
            updated: Condvar::new(),
            listeners: Mutex::new(Vec::new()),
            dispatcher,
        };
        Self {
            handle: LifecycleHandle {
                shared: Arc::new(shared),
            },
            input: BoundedQueue::new(workers.queue_capacity),
            thread: None,
            workers: workers.clone(),
        }
    }

    pub fn handle(&self) -> LifecycleHandle {
        self.handle.clone()
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    pub fn start(&mut self) -> Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        let running = RunFlag::new();
        let flag = running.clone();
        let input = self.input.clone();
        let handle = self.handle.clone();
        let timing = LoopTiming::from(&self.workers);

        self.thread = Some(WorkerThread::spawn(
            "lifecycle",
            running,
            Some(self.input.waker()),
            move || {
                run_consumer_loop("lifecycle", &input, &flag, timing, |batch| {
                    if let Some(batch) = batch {
                        handle.process(&batch);
                    }
                    Ok(())
                });
            },
        )?);
        info!("lifecycle handler started");
        Ok(())
    }

    /// Queue a batch (carrying its frame image) without blocking.
    /// `Ok(false)` means the queue is full and the batch was not taken.
    pub fn submit(&self, batch: TrackingBatch) -> Result<bool> {
        if self.thread.is_none() {
            return Err(Error::NotInitialized("lifecycle handler"));
        }
        let accepted = self.input.put(batch);
        if !accepted {
            debug!("lifecycle queue full, batch dropped");
        }
        Ok(accepted)
    }

    /// The queue behind `submit`, for in-process stages that retry on a full queue.
    pub(crate) fn input_queue(&self) -> BoundedQueue<TrackingBatch> {
        self.input.clone()
    }

    /// Apply a batch synchronously on the calling thread.
    pub fn process(&self, batch: &TrackingBatch) -> Vec<LifecycleNotification> {
        self.handle.process(batch)
    }

    pub fn snapshot(&self, kind: ObjectState, source_id: Option<SourceId>) -> Vec<ObjectResult> {
        self.handle.snapshot(kind, source_id)
    }

    pub fn stop(&mut self) -> bool {
        match self.thread.take() {
            Some(mut thread) => thread.stop(self.workers.join_timeout()),
            None => true,
        }
    }
}

impl Drop for LifecycleHandler {
    fn drop(&mut self) {
        self.stop();
    }
}

//! N homogeneous workers with a uniform lifecycle.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info};

use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::worker::processor::{Packet, Processor, ProcessorFactory, ProcessorParams, WorkerKind};
use crate::worker::queue::BoundedQueue;
use crate::worker::runner::{LoopTiming, RunFlag, WorkerThread, lock, run_consumer_loop};

/// Worker lifecycle. Methods must be called in this order; `stop` and
/// `release` are also accepted earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkerState {
    Created,
    Configured,
    Initialized,
    Running,
    Stopped,
    Released,
}

/// One processor plus its input queue, output queue and thread.
pub struct Worker {
    id: usize,
    kind: WorkerKind,
    state: WorkerState,
    processor: Arc<Mutex<Box<dyn Processor>>>,
    input: BoundedQueue<Packet>,
    output_tx: Sender<Packet>,
    output_rx: Receiver<Packet>,
    dropped: Arc<AtomicU64>,
    thread: Option<WorkerThread>,
    config: WorkerConfig,
}

impl Worker {
    fn new(
        id: usize,
        kind: WorkerKind,
        processor: Box<dyn Processor>,
        config: &WorkerConfig,
    ) -> Self {
        let (output_tx, output_rx) = crossbeam_channel::bounded(config.output_capacity.max(1));
        Self {
            id,
            kind,
            state: WorkerState::Created,
            processor: Arc::new(Mutex::new(processor)),
            input: BoundedQueue::new(config.queue_capacity),
            output_tx,
            output_rx,
            dropped: Arc::new(AtomicU64::new(0)),
            thread: None,
            config: config.clone(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    fn expect_state(&self, operation: &'static str, allowed: &[WorkerState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::InvalidState {
                id: self.id,
                operation,
                state: self.state,
            })
        }
    }

    pub fn configure(&mut self, params: ProcessorParams) -> Result<()> {
        self.expect_state("configure", &[WorkerState::Created, WorkerState::Configured])?;
        lock(&self.processor).configure(params)?;
        self.state = WorkerState::Configured;
        Ok(())
    }

    pub fn init(&mut self) -> Result<()> {
        self.expect_state("init", &[WorkerState::Configured])?;
        lock(&self.processor).init()?;
        self.state = WorkerState::Initialized;
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        self.expect_state("start", &[WorkerState::Initialized])?;

        let name = format!("{:?}-{}", self.kind, self.id).to_lowercase();
        let running = RunFlag::new();
        let timing = LoopTiming::from(&self.config);
        let processor = Arc::clone(&self.processor);
        let input = self.input.clone();
        let output = self.output_tx.clone();
        let dropped = Arc::clone(&self.dropped);
        let loop_name = name.clone();
        let flag = running.clone();

        let thread = WorkerThread::spawn(name, running, Some(self.input.waker()), move || {
            run_consumer_loop(&loop_name, &input, &flag, timing, |packet| {
                let produced = {
                    let mut processor = lock(&processor);
                    match packet {
                        Some(packet) => processor.process(packet)?,
                        None => processor.poll()?,
                    }
                };
                for packet in produced {
                    if output.try_send(packet).is_err() {
                        dropped.fetch_add(1, Ordering::Relaxed);
                        debug!(worker = %loop_name, "output queue full, dropping packet");
                    }
                }
                Ok(())
            });
        })?;

        self.thread = Some(thread);
        self.state = WorkerState::Running;
        info!(worker = self.id, kind = ?self.kind, "worker started");
        Ok(())
    }

    /// Returns `false` if the thread had to be detached after the join timeout.
    pub fn stop(&mut self) -> bool {
        let Some(mut thread) = self.thread.take() else {
            return true;
        };
        let joined = thread.stop(self.config.join_timeout());
        self.state = WorkerState::Stopped;
        joined
    }

    pub fn release(&mut self) {
        if self.state == WorkerState::Released {
            return;
        }
        self.stop();
        lock(&self.processor).release();
        self.state = WorkerState::Released;
    }

    /// Non-blocking enqueue; `Ok(false)` means the input queue is full.
    pub fn put(&self, packet: Packet) -> Result<bool> {
        if self.state < WorkerState::Initialized {
            return Err(Error::NotInitialized("worker"));
        }
        Ok(self.input.put(packet))
    }

    pub fn outputs(&self) -> Receiver<Packet> {
        self.output_rx.clone()
    }

    /// Packets discarded because the output queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn memory_bytes(&self) -> usize {
        lock(&self.processor).memory_bytes()
    }
}

/// An array of `N` workers of one kind, driven together.
pub struct WorkerArray {
    kind: WorkerKind,
    workers: Vec<Worker>,
}

impl WorkerArray {
    pub fn new(
        kind: WorkerKind,
        count: usize,
        factory: &ProcessorFactory,
        config: &WorkerConfig,
    ) -> Result<Self> {
        let workers = (0..count)
            .map(|id| Ok(Worker::new(id, kind, factory.create(kind, id)?, config)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { kind, workers })
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// One parameter set per worker, in worker order.
    pub fn configure(&mut self, params: Vec<ProcessorParams>) -> Result<()> {
        if params.len() != self.workers.len() {
            return Err(Error::ParamCountMismatch {
                expected: self.workers.len(),
                got: params.len(),
            });
        }
        for (worker, params) in self.workers.iter_mut().zip(params) {
            worker.configure(params)?;
        }
        Ok(())
    }

    pub fn init(&mut self) -> Result<()> {
        self.workers.iter_mut().try_for_each(Worker::init)
    }

    pub fn start(&mut self) -> Result<()> {
        self.workers.iter_mut().try_for_each(Worker::start)
    }

    /// Stops every worker; `false` if any had to be detached.
    pub fn stop(&mut self) -> bool {
        self.workers.iter_mut().map(Worker::stop).fold(true, |all, ok| all && ok)
    }

    pub fn release(&mut self) {
        self.workers.iter_mut().for_each(Worker::release);
    }

    pub fn worker(&self, id: usize) -> Option<&Worker> {
        self.workers.get(id)
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub fn put(&self, id: usize, packet: Packet) -> Result<bool> {
        match self.workers.get(id) {
            Some(worker) => worker.put(packet),
            None => Err(Error::Processing(format!("no worker with id {id}"))),
        }
    }

    /// Approximate memory held by each worker's processor, keyed by worker id.
    pub fn snapshot_memory(&self) -> BTreeMap<usize, usize> {
        self.workers.iter().map(|w| (w.id, w.memory_bytes())).collect()
    }
}

impl Drop for WorkerArray {
    fn drop(&mut self) {
        self.stop();
    }
}

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::{debug, warn};

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::events::event::{Event, EventBatch};
use crate::worker::{LoopTiming, RunFlag, WorkerThread, lock, run_polling_loop};

/// Anything that produces events the aggregator can drain without blocking.
pub trait EventDetector: Send + Sync {
    fn name(&self) -> &str;

    /// Take everything produced since the last call.
    fn try_drain(&self) -> Vec<Event>;
}

/// Receiving end of a detector thread's output channel.
#[derive(Debug, Clone)]
pub struct DetectorOutput {
    name: String,
    rx: Receiver<Vec<Event>>,
}

impl DetectorOutput {
    pub fn new(name: impl Into<String>, rx: Receiver<Vec<Event>>) -> Self {
        Self { name: name.into(), rx }
    }
}

impl EventDetector for DetectorOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_drain(&self) -> Vec<Event> {
        self.rx.try_iter().flatten().collect()
    }
}

type Detectors = Arc<Mutex<Vec<Box<dyn EventDetector>>>>;

/// Merges detector outputs into name-keyed batches.
pub struct Aggregator {
    detectors: Detectors,
    period: Duration,
    timing: LoopTiming,
    join_timeout: Duration,
    thread: Option<WorkerThread>,
}

impl Aggregator {
    pub fn new(detectors: Vec<Box<dyn EventDetector>>, workers: &WorkerConfig) -> Self {
        Self {
            detectors: Arc::new(Mutex::new(detectors)),
            period: Duration::from_millis(workers.aggregator_poll_ms),
            timing: LoopTiming::from(workers),
            join_timeout: workers.join_timeout(),
            thread: None,
        }
    }

    /// Add a detector; a running aggregator picks it up on its next poll.
    pub fn register(&self, detector: Box<dyn EventDetector>) {
        debug!(detector = detector.name(), "detector registered");
        lock(&self.detectors).push(detector);
    }

    pub fn detector_count(&self) -> usize {
        lock(&self.detectors).len()
    }

    /// Drain every detector once. `None` if nothing was produced.
    pub fn collect(&self) -> Option<EventBatch> {
        collect(&self.detectors)
    }

    /// Forward each non-empty batch to `downstream` every poll period.
    pub fn start(&mut self, downstream: Sender<EventBatch>) -> Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        let running = RunFlag::new();
        let flag = running.clone();
        let detectors = Arc::clone(&self.detectors);
        let (period, timing) = (self.period, self.timing);

        self.thread = Some(WorkerThread::spawn("aggregator", running, None, move || {
            run_polling_loop("aggregator", &flag, period, timing, || {
                if let Some(batch) = collect(&detectors) {
                    match downstream.try_send(batch) {
                        Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                        Err(TrySendError::Full(_)) => warn!("event batch dropped, downstream full"),
                    }
                }
                Ok(())
            });
        })?);
        Ok(())
    }

    pub fn stop(&mut self) -> bool {
        match self.thread.take() {
            Some(mut thread) => thread.stop(self.join_timeout),
            None => true,
        }
    }
}

impl Drop for Aggregator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn collect(detectors: &Mutex<Vec<Box<dyn EventDetector>>>) -> Option<EventBatch> {
    let mut batch = EventBatch::new();
    for detector in lock(detectors).iter() {
        let events = detector.try_drain();
        if !events.is_empty() {
            debug!(detector = detector.name(), count = events.len(), "events collected");
            batch.entry(detector.name().to_string()).or_default().extend(events);
        }
    }
    (!batch.is_empty()).then_some(batch)
}

//! Camera connect/disconnect events.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::{info, warn};

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::events::aggregator::DetectorOutput;
use crate::events::event::{CameraEvent, Event, Severity};
use crate::tracker::SourceId;
use crate::worker::{LoopTiming, RunFlag, WorkerThread, run_polling_loop};

/// Queue of connectivity transitions for one source. Clones share the queue.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    source_id: SourceId,
    address: Arc<str>,
    tx: Sender<(bool, DateTime<Utc>)>,
    rx: Receiver<(bool, DateTime<Utc>)>,
}

impl ConnectivityMonitor {
    pub fn new(source_id: SourceId, address: impl Into<String>) -> Self {
        let address: String = address.into();
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            source_id,
            address: Arc::from(address),
            tx,
            rx,
        }
    }

    pub fn source_id(&self) -> SourceId {
        self.source_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn record(&self, connected: bool, at: DateTime<Utc>) {
        // Both ends live in `self`, so the send cannot fail.
        let _ = self.tx.send((connected, at));
    }

    /// One event per queued transition, oldest first.
    pub fn drain(&self) -> Vec<CameraEvent> {
        self.rx
            .try_iter()
            .map(|(connected, timestamp)| CameraEvent {
                source_id: self.source_id,
                address: self.address.to_string(),
                connected,
                timestamp,
                severity: Severity::Warning,
            })
            .collect()
    }
}

/// Polls every monitor and emits their transitions as camera events.
pub struct ConnectivityDetector {
    monitors: Arc<Vec<ConnectivityMonitor>>,
    out_tx: Sender<Vec<Event>>,
    out_rx: Receiver<Vec<Event>>,
    period: Duration,
    timing: LoopTiming,
    join_timeout: Duration,
    thread: Option<WorkerThread>,
}

pub const CONNECTIVITY_DETECTOR: &str = "connectivity";

impl ConnectivityDetector {
    pub fn new(monitors: Vec<ConnectivityMonitor>, workers: &WorkerConfig) -> Self {
        let (out_tx, out_rx) = crossbeam_channel::bounded(workers.output_capacity.max(1));
        Self {
            monitors: Arc::new(monitors),
            out_tx,
            out_rx,
            period: Duration::from_millis(workers.connectivity_poll_ms),
            timing: LoopTiming::from(workers),
            join_timeout: workers.join_timeout(),
            thread: None,
        }
    }

    pub fn poll_once(&self) -> Vec<CameraEvent> {
        poll(&self.monitors)
    }

    pub fn output(&self) -> DetectorOutput {
        DetectorOutput::new(CONNECTIVITY_DETECTOR, self.out_rx.clone())
    }

    pub fn start(&mut self) -> Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        let running = RunFlag::new();
        let flag = running.clone();
        let monitors = Arc::clone(&self.monitors);
        let out = self.out_tx.clone();
        let (period, timing) = (self.period, self.timing);

        self.thread = Some(WorkerThread::spawn(CONNECTIVITY_DETECTOR, running, None, move || {
            run_polling_loop(CONNECTIVITY_DETECTOR, &flag, period, timing, || {
                let events = poll(&monitors);
                if events.is_empty() {
                    return Ok(());
                }
                match out.try_send(events.into_iter().map(Event::Camera).collect()) {
                    Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                    Err(TrySendError::Full(_)) => warn!("connectivity output full, events dropped"),
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

impl Drop for ConnectivityDetector {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll(monitors: &[ConnectivityMonitor]) -> Vec<CameraEvent> {
    let mut events = Vec::new();
    for monitor in monitors {
        for event in monitor.drain() {
            info!(
                source_id = event.source_id,
                address = %event.address,
                connected = event.connected,
                "camera connectivity changed"
            );
            events.push(event);
        }
    }
    events
}

//! FusionPipeline: synchronised camera batches in, identities, lifecycle
//! notifications and events out.
//!
//! ```text
//! push(SyncBatch) -> resolver worker -> forwarder -> lifecycle handler
//!                                           |              | signal
//!                                        fused()     zone detectors --+
//!               connectivity detector --------------------------- aggregator -> events()
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, WorkerConfig, ZoneConfig};
use crate::error::{Error, Result};
use crate::events::{
    Aggregator, ConnectivityDetector, ConnectivityMonitor, EventBatch, EventDetector, ZoneDetector,
    ZoneIdSequences, ZoneShape,
};
use crate::lifecycle::{LifecycleHandle, LifecycleHandler, LifecycleNotification, LifecycleSink};
use crate::tracker::{FusedBatch, SourceId, SyncBatch};
use crate::worker::{
    Packet, ProcessorFactory, ProcessorParams, RunFlag, WorkerArray, WorkerKind, WorkerThread,
};

/// The fusion core running on its own threads.
pub struct FusionPipeline {
    resolver: WorkerArray,
    forwarder: Option<WorkerThread>,
    lifecycle: LifecycleHandler,
    zones: Vec<ZoneDetector>,
    zone_config: ZoneConfig,
    zone_ids: ZoneIdSequences,
    connectivity: ConnectivityDetector,
    aggregator: Aggregator,
    fused_rx: Receiver<FusedBatch>,
    events_rx: Receiver<EventBatch>,
    workers: WorkerConfig,
}

impl FusionPipeline {
    /// Build and start every stage. `monitors` are the connectivity feeds of
    /// the capture stages; `sink` receives lifecycle notifications.
    pub fn start(
        config: &EngineConfig,
        monitors: Vec<ConnectivityMonitor>,
        sink: Option<Arc<dyn LifecycleSink>>,
    ) -> Result<Self> {
        config.validate()?;
        let workers = config.workers.clone();

        let mut lifecycle = match sink {
            Some(sink) => LifecycleHandler::with_sink(config.lifecycle.clone(), &workers, sink),
            None => LifecycleHandler::new(config.lifecycle.clone(), &workers),
        };
        lifecycle.start()?;

        let mut connectivity = ConnectivityDetector::new(monitors, &workers);
        connectivity.start()?;

        let detectors: Vec<Box<dyn EventDetector>> = vec![Box::new(connectivity.output())];
        let mut aggregator = Aggregator::new(detectors, &workers);
        let (events_tx, events_rx) = crossbeam_channel::bounded(workers.output_capacity.max(1));
        aggregator.start(events_tx)?;

        let factory = ProcessorFactory::with_builtin();
        let mut resolver = WorkerArray::new(WorkerKind::MultiCameraTrack, 1, &factory, &workers)?;
        resolver.configure(vec![ProcessorParams::MultiCameraTrack(config.resolver.clone())])?;
        resolver.init()?;
        resolver.start()?;

        let (fused_tx, fused_rx) = crossbeam_channel::bounded(workers.output_capacity.max(1));
        let forwarder = spawn_forwarder(&resolver, &lifecycle, fused_tx, &workers)?;

        let mut pipeline = Self {
            resolver,
            forwarder: Some(forwarder),
            lifecycle,
            zones: Vec::new(),
            zone_config: config.zones.clone(),
            zone_ids: ZoneIdSequences::default(),
            connectivity,
            aggregator,
            fused_rx,
            events_rx,
            workers,
        };
        for def in &config.zone_definitions {
            pipeline.add_zone(def.source_id, def.shape, def.coords.clone())?;
        }
        info!(zone_detectors = pipeline.zones.len(), "fusion pipeline started");
        Ok(pipeline)
    }

    /// Add a zone to `source_id`, starting that source's detector on first use.
    /// Zone and event ids are unique across every source of the pipeline.
    pub fn add_zone(
        &mut self,
        source_id: SourceId,
        shape: ZoneShape,
        vertices: Vec<(f32, f32)>,
    ) -> Result<u64> {
        shape.check_vertices(vertices.len())?;
        let idx = match self.zones.iter().position(|z| z.source_id() == source_id) {
            Some(idx) => idx,
            None => {
                let handle = self.lifecycle.handle();
                let mut detector = ZoneDetector::with_id_sequences(
                    source_id,
                    self.zone_config.clone(),
                    Arc::new(handle.clone()),
                    &self.workers,
                    &self.zone_ids,
                );
                handle.subscribe(detector.signal());
                detector.start()?;
                self.aggregator.register(Box::new(detector.output()));
                info!(source_id, "zone detector started");
                self.zones.push(detector);
                self.zones.len() - 1
            }
        };
        self.zones[idx].add_zone(shape, vertices)
    }

    /// Offer one synchronised cycle. `false` means the resolver is busy and
    /// the batch was dropped; retry or skip at the caller's stage.
    pub fn push(&self, batch: SyncBatch) -> bool {
        matches!(self.resolver.put(0, Packet::Synchronized(batch)), Ok(true))
    }

    /// Fused cycles: batches annotated with global ids, plus active identities.
    pub fn fused(&self) -> Receiver<FusedBatch> {
        self.fused_rx.clone()
    }

    pub fn events(&self) -> Receiver<EventBatch> {
        self.events_rx.clone()
    }

    pub fn lifecycle(&self) -> LifecycleHandle {
        self.lifecycle.handle()
    }

    pub fn zone_detector(&self, source_id: SourceId) -> Option<&ZoneDetector> {
        self.zones.iter().find(|z| z.source_id() == source_id)
    }

    /// Notifications the sink refused after every retry.
    pub fn drain_dead_letters(&self) -> Vec<LifecycleNotification> {
        self.lifecycle.handle().drain_dead_letters()
    }

    /// Resolver memory keyed by worker id, plus the lifecycle registry under
    /// key `usize::MAX`.
    pub fn snapshot_memory(&self) -> BTreeMap<usize, usize> {
        let mut memory = self.resolver.snapshot_memory();
        memory.insert(usize::MAX, self.lifecycle.handle().memory_bytes());
        memory
    }

    /// Stop every stage, upstream first. `false` if any thread had to be detached.
    pub fn stop(&mut self) -> bool {
        let mut clean = self.resolver.stop();
        if let Some(mut forwarder) = self.forwarder.take() {
            clean &= forwarder.stop(self.workers.join_timeout());
        }
        clean &= self.lifecycle.stop();
        for zone in &mut self.zones {
            clean &= zone.stop();
        }
        clean &= self.connectivity.stop();
        clean &= self.aggregator.stop();
        clean
    }
}

impl Drop for FusionPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Move resolver output into the lifecycle handler, one camera batch at a time.
fn spawn_forwarder(
    resolver: &WorkerArray,
    lifecycle: &LifecycleHandler,
    fused_tx: Sender<FusedBatch>,
    workers: &WorkerConfig,
) -> Result<WorkerThread> {
    let outputs = resolver
        .worker(0)
        .map(|w| w.outputs())
        .ok_or(Error::NotInitialized("resolver worker"))?;
    let input = lifecycle.input_queue();
    let running = RunFlag::new();
    let flag = running.clone();
    let poll = workers.poll_interval();

    WorkerThread::spawn("forwarder", running, None, move || {
        while flag.is_running() {
            let packet = match outputs.recv_timeout(poll) {
                Ok(packet) => packet,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            let Packet::Fused(fused) = packet else {
                warn!("forwarder ignoring unexpected packet");
                continue;
            };
            for batch in &fused.batches {
                while !input.put(batch.clone()) {
                    if !flag.is_running() {
                        return;
                    }
                    thread::sleep(Duration::from_millis(1));
                }
            }
            if fused_tx.try_send(fused).is_err() {
                debug!("fused output full, cycle not published");
            }
        }
    })
}

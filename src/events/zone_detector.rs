//! Zone entry/exit detection for one source.
//!
//! Each cycle reads the lifecycle registries and walks every active object's
//! history. An object occupies at most one zone at a time. Entry requires the
//! feet point to stay inside for `event_threshold` seconds; exit is the first
//! history entry outside the zone after entry.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::{debug, info, warn};

use crate::config::{SearchStrategy, WorkerConfig, ZoneConfig};
use crate::error::Result;
use crate::events::aggregator::DetectorOutput;
use crate::events::event::{Event, ZoneEvent};
use crate::events::zone::{Zone, ZoneShape};
use crate::ids::IdSequence;
use crate::lifecycle::{ObjectResult, ObjectResultHistory, ObjectSnapshots, ObjectState};
use crate::tracker::SourceId;
use crate::worker::{LoopTiming, ManualResetEvent, RunFlag, WorkerThread, lock, run_signal_loop};

/// Change to an existing zone, applied at the start of the next cycle.
/// New zones go through [`ZoneDetector::add_zone`].
#[derive(Debug, Clone)]
pub enum ZoneRequest {
    Delete(u64),
    SetActive(u64, bool),
}

enum ZoneChange {
    Add(Zone),
    Update(ZoneRequest),
}

struct OpenStay {
    zone_id: u64,
    event: ZoneEvent,
    latest: ObjectResultHistory,
}

struct ZoneState {
    source_id: SourceId,
    config: ZoneConfig,
    zones: BTreeMap<u64, Zone>,
    counters: BTreeMap<u64, u32>,
    open: HashMap<u64, OpenStay>,
    /// Frame of each object's last exit; older history is not searched again.
    last_exit: HashMap<u64, u64>,
    event_ids: Arc<IdSequence>,
}

/// Index of the first point satisfying `pred`.
fn first_index<F>(points: &[(f32, f32)], search: SearchStrategy, pred: F) -> Option<usize>
where
    F: Fn((f32, f32)) -> bool,
{
    match search {
        SearchStrategy::Binary => {
            let idx = points.partition_point(|&p| !pred(p));
            (idx < points.len()).then_some(idx)
        }
        SearchStrategy::Linear => points.iter().position(|&p| pred(p)),
    }
}

/// Length of the leading run of points satisfying `pred`.
fn leading_run<F>(points: &[(f32, f32)], search: SearchStrategy, pred: F) -> usize
where
    F: Fn((f32, f32)) -> bool,
{
    match search {
        SearchStrategy::Binary => points.partition_point(|&p| pred(p)),
        SearchStrategy::Linear => points.iter().take_while(|&&p| pred(p)).count(),
    }
}

impl ZoneState {
    fn apply(&mut self, change: ZoneChange) {
        let request = match change {
            ZoneChange::Add(zone) => return self.insert(zone),
            ZoneChange::Update(request) => request,
        };
        match request {
            ZoneRequest::Delete(zone_id) => {
                if self.zones.remove(&zone_id).is_some() {
                    self.counters.remove(&zone_id);
                    self.open.retain(|_, stay| stay.zone_id != zone_id);
                    info!(source_id = self.source_id, zone_id, "zone deleted");
                }
            }
            ZoneRequest::SetActive(zone_id, active) => {
                if let Some(zone) = self.zones.get_mut(&zone_id) {
                    zone.active = active;
                }
            }
        }
    }

    /// Zone ids are never reused, and a zone must have enough vertices to test against.
    fn insert(&mut self, zone: Zone) {
        let zone_id = zone.zone_id;
        if self.zones.contains_key(&zone_id) {
            warn!(source_id = self.source_id, zone_id, "zone id already in use, zone ignored");
            return;
        }
        if let Err(e) = zone.shape.check_vertices(zone.vertices.len()) {
            warn!(source_id = self.source_id, zone_id, error = %e, "malformed zone ignored");
            return;
        }
        info!(source_id = self.source_id, zone_id, shape = ?zone.shape, "zone added");
        self.counters.insert(zone_id, 0);
        self.zones.insert(zone_id, zone);
    }

    fn cycle(
        &mut self,
        active: &[ObjectResult],
        lost: impl FnOnce() -> Vec<ObjectResult>,
    ) -> Vec<ZoneEvent> {
        let mut events = Vec::new();
        let source_id = self.source_id;
        for obj in active.iter().filter(|o| o.source_id == source_id) {
            if !self.open.contains_key(&obj.object_id) {
                self.try_enter(obj, &mut events);
            }
            if self.open.contains_key(&obj.object_id) {
                self.try_exit(obj, &mut events);
            }
        }

        let active_ids: HashSet<u64> = active.iter().map(|o| o.object_id).collect();
        let gone: Vec<u64> =
            self.open.keys().filter(|id| !active_ids.contains(id)).copied().collect();
        if !gone.is_empty() {
            let lost = lost();
            for object_id in gone {
                let last = lost
                    .iter()
                    .find(|o| o.object_id == object_id)
                    .and_then(|o| o.last_snapshot().cloned());
                self.finish(object_id, last, &mut events);
            }
        }
        self.last_exit.retain(|id, _| active_ids.contains(id));
        events
    }

    fn try_enter(&mut self, obj: &ObjectResult, events: &mut Vec<ZoneEvent>) {
        let after = self.last_exit.get(&obj.object_id).copied();
        let window: Vec<&ObjectResultHistory> = obj
            .history
            .iter()
            .filter(|h| after.is_none_or(|f| h.frame_id > f))
            .collect();
        if window.is_empty() {
            return;
        }
        let points: Vec<(f32, f32)> = window.iter().map(|h| h.feet_point()).collect();
        let search = self.config.search;

        let mut best: Option<(usize, &Zone)> = None;
        for zone in self.zones.values().filter(|z| z.active) {
            if let Some(idx) = first_index(&points, search, |p| zone.contains(p)) {
                if best.is_none_or(|(b, _)| idx < b) {
                    best = Some((idx, zone));
                }
            }
        }
        let Some((first, zone)) = best else {
            return;
        };
        let run = leading_run(&points[first..], search, |p| zone.contains(p)).max(1);
        let zone = zone.clone();
        let entry = window[first];
        let dwell = window[first + run - 1].timestamp - entry.timestamp;

        if dwell < self.config.event_threshold {
            if let Some(outside) = window.get(first + run) {
                // Left before the dwell threshold; this visit never counts.
                self.last_exit.insert(obj.object_id, outside.frame_id);
            }
            return;
        }

        let event = ZoneEvent {
            event_id: self.event_ids.next_id(),
            zone,
            object_id: obj.object_id,
            entry: entry.clone(),
            exit: None,
            time_entered: entry.timestamp,
            time_left: None,
            finished: false,
        };
        let zone_id = event.zone.zone_id;
        *self.counters.entry(zone_id).or_default() += 1;
        info!(
            source_id = self.source_id,
            zone_id,
            object_id = obj.object_id,
            frame_id = entry.frame_id,
            "zone entered"
        );
        events.push(event.clone());
        self.open.insert(
            obj.object_id,
            OpenStay {
                zone_id,
                event,
                latest: window[window.len() - 1].clone(),
            },
        );
    }

    fn try_exit(&mut self, obj: &ObjectResult, events: &mut Vec<ZoneEvent>) {
        let search = self.config.search;
        let Some(stay) = self.open.get_mut(&obj.object_id) else {
            return;
        };
        let entered = stay.event.entry.frame_id;
        let window: Vec<&ObjectResultHistory> =
            obj.history.iter().filter(|h| h.frame_id >= entered).collect();
        let Some(&latest) = window.last() else {
            return;
        };
        stay.latest = latest.clone();

        let points: Vec<(f32, f32)> = window.iter().map(|h| h.feet_point()).collect();
        let zone = &stay.event.zone;
        let inside = leading_run(&points, search, |p| zone.contains(p));
        if let Some(&exit) = window.get(inside) {
            self.last_exit.insert(obj.object_id, exit.frame_id);
            self.finish(obj.object_id, Some(exit.clone()), events);
        }
    }

    /// Close an open stay at `exit`, or at the last snapshot seen if unknown.
    fn finish(
        &mut self,
        object_id: u64,
        exit: Option<ObjectResultHistory>,
        events: &mut Vec<ZoneEvent>,
    ) {
        let Some(stay) = self.open.remove(&object_id) else {
            return;
        };
        if let Some(count) = self.counters.get_mut(&stay.zone_id) {
            *count = count.saturating_sub(1);
        }
        let exit = exit.unwrap_or(stay.latest);
        let mut event = stay.event;
        event.time_left = Some(exit.timestamp);
        event.exit = Some(exit);
        event.finished = true;
        info!(
            source_id = self.source_id,
            zone_id = stay.zone_id,
            object_id,
            dwell = event.dwell_time(),
            "zone left"
        );
        events.push(event);
    }
}

/// One detector cycle's inputs, shared with the detector thread.
#[derive(Clone)]
struct ZoneCycle {
    state: Arc<Mutex<ZoneState>>,
    snapshots: Arc<dyn ObjectSnapshots>,
    changes: Receiver<ZoneChange>,
}

impl ZoneCycle {
    fn run(&self) -> Vec<ZoneEvent> {
        let mut state = lock(&self.state);
        for change in self.changes.try_iter() {
            state.apply(change);
        }
        let source_id = state.source_id;
        let active = self.snapshots.snapshot(ObjectState::Active, Some(source_id));
        state.cycle(&active, || self.snapshots.snapshot(ObjectState::Lost, None))
    }
}

/// Zone and event id sequences shared by every detector of one pipeline, so
/// ids stay unique across sources.
#[derive(Debug, Clone, Default)]
pub struct ZoneIdSequences {
    pub zones: Arc<IdSequence>,
    pub events: Arc<IdSequence>,
}

/// Stateful zone detector for one source, woken by a manual-reset signal.
pub struct ZoneDetector {
    name: String,
    source_id: SourceId,
    cycle: ZoneCycle,
    change_tx: Sender<ZoneChange>,
    zone_ids: Arc<IdSequence>,
    signal: ManualResetEvent,
    out_tx: Sender<Vec<Event>>,
    out_rx: Receiver<Vec<Event>>,
    thread: Option<WorkerThread>,
    workers: WorkerConfig,
}

impl ZoneDetector {
    pub fn new(
        source_id: SourceId,
        config: ZoneConfig,
        snapshots: Arc<dyn ObjectSnapshots>,
        workers: &WorkerConfig,
    ) -> Self {
        let ids = ZoneIdSequences::default();
        Self::with_id_sequences(source_id, config, snapshots, workers, &ids)
    }

    /// Like [`ZoneDetector::new`], drawing zone and event ids from sequences
    /// shared with the other detectors of a pipeline.
    pub fn with_id_sequences(
        source_id: SourceId,
        config: ZoneConfig,
        snapshots: Arc<dyn ObjectSnapshots>,
        workers: &WorkerConfig,
        ids: &ZoneIdSequences,
    ) -> Self {
        let (change_tx, changes) = crossbeam_channel::unbounded();
        let (out_tx, out_rx) = crossbeam_channel::bounded(workers.output_capacity.max(1));
        let state = ZoneState {
            source_id,
            config,
            zones: BTreeMap::new(),
            counters: BTreeMap::new(),
            open: HashMap::new(),
            last_exit: HashMap::new(),
            event_ids: Arc::clone(&ids.events),
        };
        Self {
            name: format!("zone:{source_id}"),
            source_id,
            cycle: ZoneCycle {
                state: Arc::new(Mutex::new(state)),
                snapshots,
                changes,
            },
            change_tx,
            zone_ids: Arc::clone(&ids.zones),
            signal: ManualResetEvent::new(),
            out_tx,
            out_rx,
            thread: None,
            workers: workers.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source_id(&self) -> SourceId {
        self.source_id
    }

    /// Wake signal; raise it whenever new lifecycle data is available.
    pub fn signal(&self) -> ManualResetEvent {
        self.signal.clone()
    }

    /// Validate and queue a new zone, returning its id.
    pub fn add_zone(&self, shape: ZoneShape, vertices: Vec<(f32, f32)>) -> Result<u64> {
        shape.check_vertices(vertices.len())?;
        let zone = Zone::new(self.zone_ids.next_id(), self.source_id, shape, vertices)?;
        let zone_id = zone.zone_id;
        self.send(ZoneChange::Add(zone));
        Ok(zone_id)
    }

    pub fn request(&self, request: ZoneRequest) {
        self.send(ZoneChange::Update(request));
    }

    fn send(&self, change: ZoneChange) {
        // The receiver lives as long as `self`.
        let _ = self.change_tx.send(change);
        self.signal.set();
    }

    /// Objects currently inside `zone_id`; 0 for an unknown zone.
    pub fn occupancy(&self, zone_id: u64) -> u32 {
        lock(&self.cycle.state).counters.get(&zone_id).copied().unwrap_or(0)
    }

    pub fn zones(&self) -> Vec<Zone> {
        lock(&self.cycle.state).zones.values().cloned().collect()
    }

    /// Apply pending requests and evaluate every active object once.
    pub fn run_cycle(&self) -> Vec<ZoneEvent> {
        self.cycle.run()
    }

    pub fn output(&self) -> DetectorOutput {
        DetectorOutput::new(self.name.clone(), self.out_rx.clone())
    }

    pub fn start(&mut self) -> Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        let running = RunFlag::new();
        let flag = running.clone();
        let cycle = self.cycle.clone();
        let signal = self.signal.clone();
        let out = self.out_tx.clone();
        let name = self.name.clone();
        let timing = LoopTiming::from(&self.workers);

        self.thread = Some(WorkerThread::spawn(
            self.name.clone(),
            running,
            Some(self.signal.waker()),
            move || {
                run_signal_loop(&name, &signal, &flag, timing, || {
                    let events = cycle.run();
                    if events.is_empty() {
                        return Ok(());
                    }
                    debug!(detector = %name, count = events.len(), "zone events emitted");
                    match out.try_send(events.into_iter().map(Event::Zone).collect()) {
                        Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                        Err(TrySendError::Full(_)) => {
                            warn!(detector = %name, "event output full, batch dropped")
                        }
                    }
                    Ok(())
                });
            },
        )?);
        Ok(())
    }

    pub fn stop(&mut self) -> bool {
        match self.thread.take() {
            Some(mut thread) => thread.stop(self.workers.join_timeout()),
            None => true,
        }
    }
}

impl Drop for ZoneDetector {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use crate::tracker::{LocalTrack, Rect};

    /// Snapshot store fed directly by the test.
    #[derive(Default)]
    struct FakeRegistry {
        active: Mutex<Vec<ObjectResult>>,
        lost: Mutex<Vec<ObjectResult>>,
    }

    impl ObjectSnapshots for FakeRegistry {
        fn snapshot(&self, kind: ObjectState, source_id: Option<SourceId>) -> Vec<ObjectResult> {
            match kind {
                ObjectState::Active => lock(&self.active)
                    .iter()
                    .filter(|o| source_id.is_none_or(|s| o.source_id == s))
                    .cloned()
                    .collect(),
                ObjectState::Lost => lock(&self.lost).clone(),
                ObjectState::New => Vec::new(),
            }
        }
    }

    fn entry(frame_id: u64, feet: (f32, f32)) -> ObjectResultHistory {
        // 0.1 x 0.2 box whose bottom midpoint is `feet`, already normalised.
        let (fx, fy) = feet;
        ObjectResultHistory {
            frame_id,
            timestamp: frame_id as f64,
            track: LocalTrack {
                camera_id: 0,
                track_id: 1,
                bbox: Rect::from_tlbr(fx - 0.05, fy - 0.2, fx + 0.05, fy),
                score: 0.9,
                class_id: 0,
                feature: None,
                global_id: None,
            },
            frame_width: 0,
            frame_height: 0,
            image: None,
        }
    }

    fn object(history: impl IntoIterator<Item = ObjectResultHistory>) -> ObjectResult {
        let history: VecDeque<ObjectResultHistory> = history.into_iter().collect();
        let last = history.back().cloned().unwrap();
        ObjectResult {
            object_id: 7,
            source_id: 0,
            class_id: 0,
            state: ObjectState::Active,
            track: last.track,
            lost_frames: 0,
            last_update: true,
            history,
        }
    }

    /// Feet point walks from outside into the zone at frame 10 and out at frame 40.
    fn feet_at(frame_id: u64) -> (f32, f32) {
        if (10..40).contains(&frame_id) { (0.5, 0.5) } else { (0.05, 0.5) }
    }

    fn detector(registry: Arc<FakeRegistry>, search: SearchStrategy) -> (ZoneDetector, u64) {
        let config = ZoneConfig {
            event_threshold: 5.0,
            search,
        };
        let detector = ZoneDetector::new(0, config, registry, &WorkerConfig::default());
        let zone_id = detector
            .add_zone(ZoneShape::Rectangle, vec![(0.3, 0.3), (0.7, 0.7)])
            .unwrap();
        (detector, zone_id)
    }

    fn replay(search: SearchStrategy) -> Vec<(u64, ZoneEvent)> {
        let registry = Arc::new(FakeRegistry::default());
        let (detector, zone_id) = detector(Arc::clone(&registry), search);
        let mut emitted = Vec::new();
        for frame in 0..=50u64 {
            let start = frame.saturating_sub(63);
            *lock(&registry.active) = vec![object((start..=frame).map(|f| entry(f, feet_at(f))))];
            for event in detector.run_cycle() {
                emitted.push((frame, event));
            }
            if frame == 20 {
                assert_eq!(detector.occupancy(zone_id), 1);
            }
        }
        assert_eq!(detector.occupancy(zone_id), 0);
        emitted
    }

    #[test]
    fn test_entry_then_exit_pairing() {
        for search in [SearchStrategy::Binary, SearchStrategy::Linear] {
            let events = replay(search);
            assert_eq!(events.len(), 2, "{search:?}");

            let (confirmed_at, entered) = &events[0];
            assert!(!entered.finished);
            assert!(*confirmed_at >= 15);
            assert_eq!(entered.entry.frame_id, 10);

            let (_, left) = &events[1];
            assert!(left.finished);
            assert_eq!(left.event_id, entered.event_id);
            assert_eq!(left.exit.as_ref().map(|h| h.frame_id), Some(40));
            assert_eq!(left.dwell_time(), Some(30.0));
        }
    }

    #[test]
    fn test_short_visit_is_debounced() {
        let registry = Arc::new(FakeRegistry::default());
        let (detector, zone_id) = detector(Arc::clone(&registry), SearchStrategy::Linear);
        let feet = |f: u64| if (3..5).contains(&f) { (0.5, 0.5) } else { (0.05, 0.5) };
        for frame in 0..=20u64 {
            *lock(&registry.active) = vec![object((0..=frame).map(|f| entry(f, feet(f))))];
            assert!(detector.run_cycle().is_empty());
        }
        assert_eq!(detector.occupancy(zone_id), 0);
    }

    #[test]
    fn test_lost_object_closes_open_stay() {
        let registry = Arc::new(FakeRegistry::default());
        let (detector, zone_id) = detector(Arc::clone(&registry), SearchStrategy::Binary);
        *lock(&registry.active) = vec![object((0..=8).map(|f| entry(f, (0.5, 0.5))))];
        let entered = detector.run_cycle();
        assert_eq!(entered.len(), 1);
        assert_eq!(detector.occupancy(zone_id), 1);

        let mut gone = object((0..=9).map(|f| entry(f, (0.5, 0.5))));
        gone.state = ObjectState::Lost;
        *lock(&registry.lost) = vec![gone];
        lock(&registry.active).clear();

        let finished = detector.run_cycle();
        assert_eq!(finished.len(), 1);
        assert!(finished[0].finished);
        assert_eq!(finished[0].exit.as_ref().map(|h| h.frame_id), Some(9));
        assert_eq!(detector.occupancy(zone_id), 0);
    }

    #[test]
    fn test_inactive_and_deleted_zones() {
        let registry = Arc::new(FakeRegistry::default());
        let (detector, zone_id) = detector(Arc::clone(&registry), SearchStrategy::Binary);
        *lock(&registry.active) = vec![object((0..=8).map(|f| entry(f, (0.5, 0.5))))];

        detector.request(ZoneRequest::SetActive(zone_id, false));
        assert!(detector.run_cycle().is_empty());

        detector.request(ZoneRequest::SetActive(zone_id, true));
        assert_eq!(detector.run_cycle().len(), 1);
        assert_eq!(detector.occupancy(zone_id), 1);

        detector.request(ZoneRequest::Delete(zone_id));
        assert!(detector.run_cycle().is_empty());
        assert_eq!(detector.occupancy(zone_id), 0);
        assert!(detector.zones().is_empty());
    }

    #[test]
    fn test_zone_ids_increase() {
        let registry = Arc::new(FakeRegistry::default());
        let workers = WorkerConfig::default();
        let detector = ZoneDetector::new(0, ZoneConfig::default(), registry, &workers);
        let a = detector.add_zone(ZoneShape::Rectangle, vec![(0.0, 0.0), (0.5, 0.5)]).unwrap();
        let b = detector
            .add_zone(ZoneShape::Polygon, vec![(0.0, 0.0), (1.0, 0.0), (0.5, 1.0)])
            .unwrap();
        assert!(b > a);
        assert!(detector.add_zone(ZoneShape::Polygon, vec![(0.0, 0.0)]).is_err());
    }

    fn state(ids: &ZoneIdSequences) -> ZoneState {
        ZoneState {
            source_id: 0,
            config: ZoneConfig::default(),
            zones: BTreeMap::new(),
            counters: BTreeMap::new(),
            open: HashMap::new(),
            last_exit: HashMap::new(),
            event_ids: Arc::clone(&ids.events),
        }
    }

    #[test]
    fn test_malformed_or_duplicate_zone_is_ignored() {
        let mut state = state(&ZoneIdSequences::default());
        let square = Zone::new(1, 0, ZoneShape::Rectangle, vec![(0.3, 0.3), (0.7, 0.7)]).unwrap();
        state.apply(ZoneChange::Add(square.clone()));

        let mut clash = square.clone();
        clash.vertices = vec![(0.0, 0.0), (0.1, 0.1)];
        state.apply(ZoneChange::Add(clash));

        let mut empty = square;
        empty.zone_id = 2;
        empty.shape = ZoneShape::Polygon;
        empty.vertices.clear();
        state.apply(ZoneChange::Add(empty));

        assert_eq!(state.zones.keys().copied().collect::<Vec<_>>(), vec![1]);
        assert_eq!(state.zones[&1].vertices, vec![(0.3, 0.3), (0.7, 0.7)]);

        // Cycling with an object inside the surviving zone must not panic.
        let active = vec![object((0..=12).map(|f| entry(f, (0.5, 0.5))))];
        let events = state.cycle(&active, Vec::new);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].zone.zone_id, 1);
    }

    #[test]
    fn test_shared_sequences_keep_ids_unique_across_sources() {
        let ids = ZoneIdSequences::default();
        let registry = Arc::new(FakeRegistry::default());
        let mut both = object((0..=12).map(|f| entry(f, (0.5, 0.5))));
        let mut other = both.clone();
        other.source_id = 1;
        other.object_id = 8;
        both.source_id = 0;
        *lock(&registry.active) = vec![both, other];

        let (config, workers) = (ZoneConfig::default(), WorkerConfig::default());
        let first =
            ZoneDetector::with_id_sequences(0, config.clone(), registry.clone(), &workers, &ids);
        let second = ZoneDetector::with_id_sequences(1, config, registry, &workers, &ids);
        let a = first.add_zone(ZoneShape::Rectangle, vec![(0.3, 0.3), (0.7, 0.7)]).unwrap();
        let b = second.add_zone(ZoneShape::Rectangle, vec![(0.3, 0.3), (0.7, 0.7)]).unwrap();
        assert_ne!(a, b);

        let from_first = first.run_cycle();
        let from_second = second.run_cycle();
        assert_eq!(from_first.len(), 1);
        assert_eq!(from_second.len(), 1);
        assert_ne!(from_first[0].event_id, from_second[0].event_id);
        assert_eq!(ids.events.last_issued(), 2);
    }
}

//! New/active/lost bookkeeping for every object ever seen.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::LifecycleConfig;
use crate::ids::IdSequence;
use crate::lifecycle::object::{ObjectResult, ObjectResultHistory, ObjectState};
use crate::lifecycle::sink::{LifecycleNotification, NotificationKind};
use crate::tracker::{SourceId, TrackingBatch};

pub struct ObjectRegistry {
    config: LifecycleConfig,
    new: Vec<ObjectResult>,
    active: Vec<ObjectResult>,
    lost: VecDeque<ObjectResult>,
    last_frame: HashMap<SourceId, u64>,
    ids: Arc<IdSequence>,
}

impl ObjectRegistry {
    pub fn new(config: LifecycleConfig) -> Self {
        Self::with_id_sequence(config, Arc::new(IdSequence::new()))
    }

    pub fn with_id_sequence(config: LifecycleConfig, ids: Arc<IdSequence>) -> Self {
        Self {
            config,
            new: Vec::new(),
            active: Vec::new(),
            lost: VecDeque::new(),
            last_frame: HashMap::new(),
            ids,
        }
    }

    /// Fold one source's batch into the registry.
    ///
    /// Tracks continuing an active object (same source, same local track id)
    /// extend its history; the rest open new objects. Active objects of this
    /// source that were not matched age by one cycle and move to the lost
    /// registry after `lost_thresh` misses.
    ///
    /// Batches must arrive in increasing frame order per source; a stale or
    /// repeated frame is ignored.
    pub fn apply(&mut self, batch: &TrackingBatch) -> Vec<LifecycleNotification> {
        let source_id = batch.source_id;
        if let Some(&last) = self.last_frame.get(&source_id) {
            if batch.frame_id <= last {
                warn!(source_id, frame_id = batch.frame_id, last, "out-of-order batch ignored");
                return Vec::new();
            }
        }
        self.last_frame.insert(source_id, batch.frame_id);

        self.new.clear();
        for obj in self.active.iter_mut().filter(|o| o.source_id == source_id) {
            obj.last_update = false;
        }

        let history_len = self.config.history_len;
        let mut notifications = Vec::with_capacity(batch.tracks.len());
        for track in &batch.tracks {
            let mut track = track.clone();
            track.camera_id = source_id;
            let snapshot = ObjectResultHistory {
                frame_id: batch.frame_id,
                timestamp: batch.timestamp,
                track,
                frame_width: batch.frame_width,
                frame_height: batch.frame_height,
                image: batch.image.clone(),
            };

            let existing = self
                .active
                .iter_mut()
                .find(|o| o.source_id == source_id && o.track.track_id == snapshot.track.track_id);

            let (kind, object_id) = match existing {
                Some(obj) => {
                    obj.push_history(snapshot.clone(), history_len);
                    obj.lost_frames = 0;
                    obj.last_update = true;
                    (NotificationKind::Updated, obj.object_id)
                }
                None => {
                    let object_id = self.ids.next_id();
                    let mut obj = ObjectResult::new(object_id, snapshot.clone(), history_len);
                    debug!(source_id, object_id, track_id = obj.track.track_id, "object created");
                    self.new.push(obj.clone());
                    obj.state = ObjectState::Active;
                    self.active.push(obj);
                    (NotificationKind::Created, object_id)
                }
            };
            notifications.push(LifecycleNotification {
                kind,
                object_id,
                source_id,
                snapshot,
            });
        }

        self.sweep(source_id);
        notifications
    }

    fn sweep(&mut self, source_id: SourceId) {
        let lost_thresh = self.config.lost_thresh;
        let mut idx = 0;
        while idx < self.active.len() {
            let obj = &mut self.active[idx];
            if obj.source_id == source_id && !obj.last_update {
                obj.lost_frames += 1;
                if obj.lost_frames >= lost_thresh {
                    let mut obj = self.active.remove(idx);
                    obj.state = ObjectState::Lost;
                    info!(
                        source_id,
                        object_id = obj.object_id,
                        history = obj.history.len(),
                        "object lost"
                    );
                    self.push_lost(obj);
                    continue;
                }
            }
            idx += 1;
        }
    }

    fn push_lost(&mut self, obj: ObjectResult) {
        self.lost.push_back(obj);
        while self.lost.len() > self.config.lost_capacity {
            if let Some(evicted) = self.lost.pop_front() {
                debug!(object_id = evicted.object_id, "lost object evicted");
            }
        }
    }

    /// Deep copy of one registry. `source_id` filters the active registry only.
    pub fn snapshot(&self, kind: ObjectState, source_id: Option<SourceId>) -> Vec<ObjectResult> {
        match kind {
            ObjectState::New => self.new.clone(),
            ObjectState::Active => self
                .active
                .iter()
                .filter(|o| source_id.is_none_or(|s| o.source_id == s))
                .cloned()
                .collect(),
            ObjectState::Lost => self.lost.iter().cloned().collect(),
        }
    }

    pub fn count(&self, kind: ObjectState) -> usize {
        match kind {
            ObjectState::New => self.new.len(),
            ObjectState::Active => self.active.len(),
            ObjectState::Lost => self.lost.len(),
        }
    }

    pub fn memory_bytes(&self) -> usize {
        self.new
            .iter()
            .chain(self.active.iter())
            .chain(self.lost.iter())
            .map(ObjectResult::memory_bytes)
            .sum()
    }
}

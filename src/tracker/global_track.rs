//! Persistent cross-camera identity.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::ids::IdSequence;
use crate::tracker::local_track::{Feature, LocalTrack, LocalTrackId, SourceId};
use crate::tracker::matching::mean_feature;

/// One physical object fused across every camera that currently sees it.
#[derive(Debug, Clone)]
pub struct GlobalTrack {
    /// Unique identity, 0 until activated
    pub global_id: u64,
    /// Set once on activation and never cleared
    pub is_activated: bool,
    /// Local track per camera for the current cycle; empty when unseen
    pub tracks: BTreeMap<SourceId, LocalTrack>,
    /// Cycle of activation
    pub start_cycle: u64,
    /// Last cycle in which at least one camera saw this object
    pub last_seen_cycle: u64,
    features: VecDeque<Feature>,
    feature_capacity: usize,
    smooth_feature: Option<Feature>,
}

impl GlobalTrack {
    pub fn new(feature_capacity: usize) -> Self {
        Self {
            global_id: 0,
            is_activated: false,
            tracks: BTreeMap::new(),
            start_cycle: 0,
            last_seen_cycle: 0,
            features: VecDeque::with_capacity(feature_capacity.min(16)),
            feature_capacity: feature_capacity.max(1),
            smooth_feature: None,
        }
    }

    /// Issue an identity. Only the first call has any effect.
    pub fn activate(&mut self, ids: &IdSequence, cycle: u64) {
        if self.is_activated {
            return;
        }
        self.global_id = ids.next_id();
        self.is_activated = true;
        self.start_cycle = cycle;
        self.last_seen_cycle = cycle;
    }

    /// Replace the per-camera view with this cycle's members and feed the
    /// feature buffer from those not flagged in `suppressed`.
    pub fn update(&mut self, members: Vec<LocalTrack>, suppressed: &[bool], cycle: u64) {
        self.tracks.clear();
        for (idx, mut track) in members.into_iter().enumerate() {
            if !suppressed.get(idx).copied().unwrap_or(false) {
                if let Some(feature) = &track.feature {
                    self.push_feature(feature.clone());
                }
            }
            track.global_id = self.is_activated.then_some(self.global_id);
            self.tracks.insert(track.camera_id, track);
        }
        if !self.tracks.is_empty() {
            self.last_seen_cycle = cycle;
        }
    }

    fn push_feature(&mut self, feature: Feature) {
        if self.features.len() == self.feature_capacity {
            self.features.pop_front();
        }
        self.features.push_back(feature);
    }

    /// Recompute the smoothed embedding as the mean of the rolling buffer.
    pub fn refresh_smooth_feature(&mut self) {
        self.smooth_feature = mean_feature(self.features.iter());
    }

    pub fn smooth_feature(&self) -> Option<&Feature> {
        self.smooth_feature.as_ref()
    }

    pub fn feature_count(&self) -> usize {
        self.features.len()
    }

    /// Drop this cycle's camera view; the identity itself persists.
    pub fn clear_visibility(&mut self) {
        self.tracks.clear();
    }

    pub fn is_visible(&self) -> bool {
        !self.tracks.is_empty()
    }

    /// The (camera, local id) pairs currently held.
    pub fn keys(&self) -> BTreeSet<(SourceId, LocalTrackId)> {
        self.tracks.values().map(LocalTrack::key).collect()
    }

    /// Every constituent local track has ended: nothing has been seen for
    /// more than `max_invisible_cycles`.
    pub fn is_removed(&self, cycle: u64, max_invisible_cycles: u64) -> bool {
        !self.is_visible() && cycle.saturating_sub(self.last_seen_cycle) > max_invisible_cycles
    }

    /// Approximate heap footprint in bytes.
    pub fn memory_bytes(&self) -> usize {
        let feature_bytes: usize = self
            .features
            .iter()
            .chain(self.smooth_feature.iter())
            .map(|f| f.len() * std::mem::size_of::<f32>())
            .sum();
        let track_bytes = self.tracks.len() * std::mem::size_of::<LocalTrack>();
        std::mem::size_of::<Self>() + track_bytes + feature_bytes
    }
}

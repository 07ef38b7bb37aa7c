//! Cross-camera identity resolution.
//!
//! Each cycle takes one synchronised set of per-camera track lists, clusters
//! them by appearance and carries identities forward:
//!
//! 1. Smooth every known identity's embedding from its rolling buffer.
//! 2. Cluster this cycle's tracks (average linkage, never two tracks from the
//!    same camera in one cluster).
//! 3. Re-attach clusters whose (camera, local id) set is unchanged.
//! 4. Re-attach the rest by appearance with a Hungarian assignment.
//! 5. Open new identities for whatever is left.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::config::ResolverConfig;
use crate::error::{Error, Result};
use crate::ids::IdSequence;
use crate::tracker::clustering::{average_linkage, group_by_label};
use crate::tracker::global_track::GlobalTrack;
use crate::tracker::local_track::{Feature, LocalTrack, LocalTrackId, SourceId, SyncBatch};
use crate::tracker::matching::{self, AssignmentResult, FORBIDDEN};
use crate::tracker::rect::{Rect, max_overlap_ratios};
use crate::worker::{Packet, Processor, ProcessorParams, WorkerKind};

/// Output of one resolver cycle: the input batches annotated with global ids,
/// plus every activated identity.
#[derive(Debug, Clone)]
pub struct FusedBatch {
    pub cycle: u64,
    pub batches: SyncBatch,
    pub global_tracks: Vec<GlobalTrack>,
}

/// Tracks grouped into one cluster this cycle, at most one per camera.
struct TransientCluster {
    members: Vec<LocalTrack>,
    suppressed: Vec<bool>,
}

impl TransientCluster {
    fn keys(&self) -> BTreeSet<(SourceId, LocalTrackId)> {
        self.members.iter().map(LocalTrack::key).collect()
    }

    fn mean_feature(&self) -> Option<Feature> {
        matching::mean_feature(self.members.iter().filter_map(|t| t.feature.as_ref()))
    }
}

pub struct CrossCameraResolver {
    config: ResolverConfig,
    tracks: Vec<GlobalTrack>,
    ids: Arc<IdSequence>,
    cycle: u64,
}

impl CrossCameraResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self::with_id_sequence(config, Arc::new(IdSequence::new()))
    }

    pub fn with_id_sequence(config: ResolverConfig, ids: Arc<IdSequence>) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            ids,
            cycle: 0,
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Every identity held, activated or not.
    pub fn global_tracks(&self) -> &[GlobalTrack] {
        &self.tracks
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Run one cycle. Local tracks in `batches` get their `global_id` filled in;
    /// the activated identities are returned.
    pub fn update(&mut self, batches: &mut SyncBatch) -> Vec<GlobalTrack> {
        if batches.iter().all(|b| b.tracks.is_empty()) {
            return Vec::new();
        }
        self.cycle += 1;
        let cycle = self.cycle;

        for track in &mut self.tracks {
            track.refresh_smooth_feature();
        }

        let observations: Vec<LocalTrack> = batches
            .iter()
            .flat_map(|b| b.tracks.iter().cloned().map(move |mut t| {
                t.camera_id = b.source_id;
                t
            }))
            .collect();
        let clusters = self.cluster(observations);

        // Exact match on the full (camera, local id) set.
        let mut by_keys: HashMap<BTreeSet<(SourceId, LocalTrackId)>, usize> = HashMap::new();
        for (idx, track) in self.tracks.iter().enumerate() {
            if track.is_activated && track.is_visible() {
                by_keys.insert(track.keys(), idx);
            }
        }

        let mut matched_tracks = HashSet::new();
        let mut remaining = Vec::new();
        for cluster in clusters {
            match by_keys.get(&cluster.keys()) {
                Some(&idx) if !matched_tracks.contains(&idx) => {
                    self.tracks[idx].update(cluster.members, &cluster.suppressed, cycle);
                    matched_tracks.insert(idx);
                }
                _ => remaining.push(cluster),
            }
        }

        let unmatched: Vec<usize> = (0..self.tracks.len())
            .filter(|idx| !matched_tracks.contains(idx))
            .collect();
        for &idx in &unmatched {
            self.tracks[idx].clear_visibility();
        }

        // Appearance match between leftover identities and leftover clusters.
        let candidates: Vec<usize> = unmatched
            .into_iter()
            .filter(|&idx| self.tracks[idx].is_activated)
            .collect();
        let cluster_features: Vec<Option<Feature>> =
            remaining.iter().map(TransientCluster::mean_feature).collect();
        let track_features: Vec<Option<&Feature>> =
            candidates.iter().map(|&idx| self.tracks[idx].smooth_feature()).collect();
        let cluster_refs: Vec<Option<&Feature>> =
            cluster_features.iter().map(Option::as_ref).collect();
        let dists = matching::cosine_distance_matrix(&track_features, &cluster_refs);

        let AssignmentResult {
            matches,
            unmatched_cols,
            ..
        } = matching::linear_assignment(&dists, self.config.clustering_threshold);

        let mut slots: Vec<Option<TransientCluster>> = remaining.into_iter().map(Some).collect();
        for (row, col) in matches {
            if let Some(cluster) = slots[col].take() {
                let idx = candidates[row];
                trace!(
                    global_id = self.tracks[idx].global_id,
                    distance = dists[[row, col]],
                    "appearance re-association"
                );
                self.tracks[idx].update(cluster.members, &cluster.suppressed, cycle);
            }
        }

        // New identities, never stealing a pair another identity already holds.
        let mut owned: HashSet<(SourceId, LocalTrackId)> = self
            .tracks
            .iter()
            .filter(|t| t.is_activated)
            .flat_map(|t| t.keys())
            .collect();
        for col in unmatched_cols {
            let Some(cluster) = slots[col].take() else { continue };
            let (members, suppressed): (Vec<_>, Vec<_>) = cluster
                .members
                .into_iter()
                .zip(cluster.suppressed)
                .filter(|(t, _)| !owned.contains(&t.key()))
                .unzip();
            if members.is_empty() {
                continue;
            }
            owned.extend(members.iter().map(LocalTrack::key));

            let mut track = GlobalTrack::new(self.config.feature_buffer_len);
            track.activate(&self.ids, cycle);
            track.update(members, &suppressed, cycle);
            debug!(global_id = track.global_id, cameras = track.tracks.len(), "new global track");
            self.tracks.push(track);
        }

        self.annotate(batches);
        if self.config.reap_interval > 0 && cycle % self.config.reap_interval == 0 {
            self.reap();
        }

        self.tracks.iter().filter(|t| t.is_activated).cloned().collect()
    }

    fn cluster(&self, observations: Vec<LocalTrack>) -> Vec<TransientCluster> {
        let cameras: Vec<SourceId> = observations.iter().map(|t| t.camera_id).collect();
        let features: Vec<Option<&Feature>> =
            observations.iter().map(|t| t.feature.as_ref()).collect();

        let mut dists = matching::cosine_distance_matrix(&features, &features);
        for i in 0..cameras.len() {
            for j in 0..cameras.len() {
                if i != j && cameras[i] == cameras[j] {
                    dists[[i, j]] = FORBIDDEN;
                }
            }
        }

        let suppressed = self.overlap_suppression(&observations);
        let labels = average_linkage(&dists, &cameras, self.config.clustering_threshold);

        let mut slots: Vec<Option<LocalTrack>> = observations.into_iter().map(Some).collect();
        group_by_label(&labels)
            .into_iter()
            .map(|indices| {
                let mut cluster = TransientCluster {
                    members: Vec::with_capacity(indices.len()),
                    suppressed: Vec::with_capacity(indices.len()),
                };
                for idx in indices {
                    if let Some(track) = slots[idx].take() {
                        cluster.members.push(track);
                        cluster.suppressed.push(suppressed[idx]);
                    }
                }
                cluster
            })
            .collect()
    }

    /// Flags tracks too occluded by a same-camera neighbour to give a clean embedding.
    fn overlap_suppression(&self, observations: &[LocalTrack]) -> Vec<bool> {
        let mut suppressed = vec![false; observations.len()];
        let mut per_camera: HashMap<SourceId, Vec<usize>> = HashMap::new();
        for (idx, track) in observations.iter().enumerate() {
            per_camera.entry(track.camera_id).or_default().push(idx);
        }
        for indices in per_camera.values() {
            let boxes: Vec<Rect> = indices.iter().map(|&i| observations[i].bbox).collect();
            for (&idx, ratio) in indices.iter().zip(max_overlap_ratios(&boxes)) {
                suppressed[idx] = ratio > self.config.overlap_threshold;
            }
        }
        suppressed
    }

    fn annotate(&self, batches: &mut SyncBatch) {
        let lookup: HashMap<(SourceId, LocalTrackId), u64> = self
            .tracks
            .iter()
            .filter(|t| t.is_activated)
            .flat_map(|t| t.tracks.values().map(move |lt| (lt.key(), t.global_id)))
            .collect();
        for batch in batches.iter_mut() {
            for track in &mut batch.tracks {
                track.global_id = lookup.get(&(batch.source_id, track.track_id)).copied();
            }
        }
    }

    /// Purge identities that have been invisible for too long.
    pub fn reap(&mut self) -> usize {
        let before = self.tracks.len();
        let (cycle, ttl) = (self.cycle, self.config.max_invisible_cycles);
        self.tracks.retain(|t| !t.is_removed(cycle, ttl));
        let reaped = before - self.tracks.len();
        if reaped > 0 {
            debug!(reaped, remaining = self.tracks.len(), "reaped global tracks");
        }
        reaped
    }

    pub fn memory_bytes(&self) -> usize {
        let tracks: usize = self.tracks.iter().map(GlobalTrack::memory_bytes).sum();
        std::mem::size_of::<Self>() + tracks
    }
}

impl Processor for CrossCameraResolver {
    fn kind(&self) -> WorkerKind {
        WorkerKind::MultiCameraTrack
    }

    fn configure(&mut self, params: ProcessorParams) -> Result<()> {
        match params {
            ProcessorParams::MultiCameraTrack(config) => {
                config.validate()?;
                self.config = config;
                Ok(())
            }
            other => Err(Error::InvalidParams {
                kind: WorkerKind::MultiCameraTrack,
                reason: format!("expected resolver settings, got {:?}", other.kind()),
            }),
        }
    }

    fn process(&mut self, input: Packet) -> Result<Vec<Packet>> {
        match input {
            Packet::Synchronized(mut batches) => {
                let global_tracks = self.update(&mut batches);
                Ok(vec![Packet::Fused(FusedBatch {
                    cycle: self.cycle,
                    batches,
                    global_tracks,
                })])
            }
            other => Err(Error::Processing(format!(
                "resolver expects synchronised batches, got {}",
                other.name()
            ))),
        }
    }

    fn memory_bytes(&self) -> usize {
        CrossCameraResolver::memory_bytes(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::local_track::TrackingBatch;

    fn track(track_id: LocalTrackId, x: f32, feature: &[f32]) -> LocalTrack {
        LocalTrack {
            camera_id: 0,
            track_id,
            bbox: Rect::new(x, 0.0, 10.0, 20.0),
            score: 0.9,
            class_id: 0,
            feature: Some(Feature::from_row_slice(feature)),
            global_id: None,
        }
    }

    fn batch(source_id: SourceId, tracks: Vec<LocalTrack>) -> TrackingBatch {
        TrackingBatch::new(source_id, 1, 0.0, tracks)
    }

    #[test]
    fn test_empty_cycle_is_noop() {
        let mut resolver = CrossCameraResolver::new(ResolverConfig::default());
        let mut input = vec![batch(0, vec![]), batch(1, vec![])];
        assert!(resolver.update(&mut input).is_empty());
        assert_eq!(resolver.cycle(), 0);
    }

    #[test]
    fn test_fuses_matching_appearance_across_cameras() {
        let mut resolver = CrossCameraResolver::new(ResolverConfig::default());
        let mut input = vec![
            batch(0, vec![track(1, 0.0, &[1.0, 0.0]), track(2, 100.0, &[0.0, 1.0])]),
            batch(1, vec![track(7, 50.0, &[0.98, 0.05])]),
        ];
        let globals = resolver.update(&mut input);

        assert_eq!(globals.len(), 2);
        let fused = input[0].tracks[0].global_id;
        assert!(fused.is_some());
        assert_eq!(input[1].tracks[0].global_id, fused);
        assert_ne!(input[0].tracks[1].global_id, fused);
    }

    #[test]
    fn test_exact_match_keeps_identity() {
        let mut resolver = CrossCameraResolver::new(ResolverConfig::default());
        let mut first = vec![batch(0, vec![track(1, 0.0, &[1.0, 0.0])])];
        let id = resolver.update(&mut first)[0].global_id;

        // Embedding changes completely but the local track is the same.
        let mut second = vec![batch(0, vec![track(1, 5.0, &[0.0, 1.0])])];
        let globals = resolver.update(&mut second);
        assert_eq!(globals.len(), 1);
        assert_eq!(second[0].tracks[0].global_id, Some(id));
    }

    #[test]
    fn test_appearance_match_recovers_new_local_id() {
        let mut resolver = CrossCameraResolver::new(ResolverConfig::default());
        let mut first = vec![batch(0, vec![track(1, 0.0, &[1.0, 0.0])])];
        let id = resolver.update(&mut first)[0].global_id;

        // The single-camera tracker lost the object and re-issued a new local id.
        let mut second = vec![batch(0, vec![track(9, 0.0, &[0.99, 0.02])])];
        resolver.update(&mut second);
        assert_eq!(second[0].tracks[0].global_id, Some(id));
    }

    #[test]
    fn test_overlapping_detections_are_suppressed() {
        let resolver = CrossCameraResolver::new(ResolverConfig::default());
        let mut a = track(1, 0.0, &[1.0]);
        let mut b = track(2, 2.0, &[1.0]);
        let c = track(3, 200.0, &[1.0]);
        a.camera_id = 4;
        b.camera_id = 4;
        let suppressed = resolver.overlap_suppression(&[a, b, c]);
        assert_eq!(suppressed, vec![true, true, false]);
    }

    #[test]
    fn test_reap_purges_long_invisible_tracks() {
        let config = ResolverConfig {
            reap_interval: 1,
            max_invisible_cycles: 2,
            ..ResolverConfig::default()
        };
        let mut resolver = CrossCameraResolver::new(config);
        resolver.update(&mut vec![batch(0, vec![track(1, 0.0, &[1.0, 0.0])])]);
        for _ in 0..3 {
            resolver.update(&mut vec![batch(0, vec![track(2, 300.0, &[0.0, 1.0])])]);
        }
        let ids: Vec<u64> = resolver.global_tracks().iter().map(|t| t.global_id).collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn test_zero_reap_interval_never_reaps() {
        let config = ResolverConfig {
            reap_interval: 0,
            max_invisible_cycles: 0,
            ..ResolverConfig::default()
        };
        let mut resolver = CrossCameraResolver::new(config);
        resolver.update(&mut vec![batch(0, vec![track(1, 0.0, &[1.0, 0.0])])]);
        for _ in 0..3 {
            resolver.update(&mut vec![batch(0, vec![track(2, 300.0, &[0.0, 1.0])])]);
        }
        assert_eq!(resolver.global_tracks().len(), 2);
    }

    #[test]
    fn test_configure_rejects_invalid_settings() {
        let mut resolver = CrossCameraResolver::new(ResolverConfig::default());
        let bad = ResolverConfig {
            reap_interval: 0,
            ..ResolverConfig::default()
        };
        let err = resolver.configure(ProcessorParams::MultiCameraTrack(bad)).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert_eq!(resolver.config().reap_interval, 100);
    }

    #[test]
    fn test_new_identity_never_takes_an_owned_pair() {
        let mut resolver = CrossCameraResolver::new(ResolverConfig::default());
        let mut first = vec![batch(0, vec![track(1, 0.0, &[1.0, 0.0])])];
        let id = resolver.update(&mut first)[0].global_id;

        // Camera 0 reports local track 1 twice; the second copy clusters with
        // camera 1's track and must not be handed to the new identity.
        let mut other = track(5, 50.0, &[0.0, 1.0]);
        other.camera_id = 1;
        let mut input = vec![
            batch(0, vec![track(1, 0.0, &[1.0, 0.0]), track(1, 300.0, &[0.0, 1.0])]),
            batch(1, vec![other]),
        ];
        let globals = resolver.update(&mut input);
        assert_eq!(globals.len(), 2);

        let keys = |global_id: u64| {
            let track = globals.iter().find(|t| t.global_id == global_id).unwrap();
            track.keys().into_iter().collect::<Vec<_>>()
        };
        let fresh = globals.iter().map(|t| t.global_id).find(|&g| g != id).unwrap();
        assert_eq!(keys(id), vec![(0, 1)]);
        assert_eq!(keys(fresh), vec![(1, 5)]);
        assert_eq!(input[0].tracks[0].global_id, Some(id));
        assert_eq!(input[1].tracks[0].global_id, Some(fresh));
    }
}

use std::collections::VecDeque;

use crate::tracker::{FrameImage, LocalTrack, SourceId};

/// Object lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ObjectState {
    /// Created in the most recent cycle
    #[default]
    New,
    /// Seen within the last `lost_thresh` cycles
    Active,
    /// Missing for `lost_thresh` cycles; terminal
    Lost,
}

/// Immutable snapshot of an object in one frame.
#[derive(Debug, Clone)]
pub struct ObjectResultHistory {
    pub frame_id: u64,
    /// Stream time in seconds.
    pub timestamp: f64,
    pub track: LocalTrack,
    pub frame_width: u32,
    pub frame_height: u32,
    pub image: Option<FrameImage>,
}

impl ObjectResultHistory {
    /// Feet point in normalised image coordinates.
    pub fn feet_point(&self) -> (f32, f32) {
        let (x, y) = self.track.bbox.feet_point();
        if self.frame_width == 0 || self.frame_height == 0 {
            (x, y)
        } else {
            (x / self.frame_width as f32, y / self.frame_height as f32)
        }
    }
}

/// One physical object as seen by one source, from first sighting until lost.
#[derive(Debug, Clone)]
pub struct ObjectResult {
    pub object_id: u64,
    pub source_id: SourceId,
    pub class_id: u32,
    pub state: ObjectState,
    /// Latest local track
    pub track: LocalTrack,
    /// Consecutive cycles without a matching track
    pub lost_frames: u32,
    /// Matched in the most recent cycle for its source
    pub last_update: bool,
    /// Oldest first, at most `history_len` entries
    pub history: VecDeque<ObjectResultHistory>,
}

impl ObjectResult {
    pub(crate) fn new(object_id: u64, snapshot: ObjectResultHistory, history_len: usize) -> Self {
        let mut history = VecDeque::with_capacity(history_len.min(64));
        let track = snapshot.track.clone();
        history.push_back(snapshot);
        Self {
            object_id,
            source_id: track.camera_id,
            class_id: track.class_id,
            state: ObjectState::New,
            track,
            lost_frames: 0,
            last_update: true,
            history,
        }
    }

    /// Append a snapshot, evicting the oldest beyond `history_len`.
    pub(crate) fn push_history(&mut self, snapshot: ObjectResultHistory, history_len: usize) {
        self.track = snapshot.track.clone();
        self.history.push_back(snapshot);
        while self.history.len() > history_len.max(1) {
            self.history.pop_front();
        }
    }

    pub fn last_snapshot(&self) -> Option<&ObjectResultHistory> {
        self.history.back()
    }

    pub fn memory_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.history.len() * std::mem::size_of::<ObjectResultHistory>()
            + self
                .history
                .iter()
                .filter_map(|h| h.track.feature.as_ref())
                .map(|f| f.len() * std::mem::size_of::<f32>())
                .sum::<usize>()
    }
}

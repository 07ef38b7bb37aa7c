//! Per-camera inputs handed over by the external detector and single-camera tracker.

use std::sync::Arc;

use nalgebra::DVector;

use crate::tracker::rect::Rect;

pub type SourceId = u32;
pub type LocalTrackId = u64;

/// Appearance embedding produced by the external re-identification model.
pub type Feature = DVector<f32>;

/// Raw detector output for one object, before a single-camera tracker assigns ids.
#[derive(Debug, Clone)]
pub struct Detection {
    /// Bounding box in pixel coordinates
    pub bbox: Rect,
    /// Detection confidence score
    pub score: f32,
    pub class_id: u32,
    pub feature: Option<Feature>,
}

impl Detection {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> Self {
        Self {
            bbox: Rect::from_tlbr(x1, y1, x2, y2),
            score,
            class_id: 0,
            feature: None,
        }
    }
}

/// One single-camera track as seen in one frame.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    pub camera_id: SourceId,
    pub track_id: LocalTrackId,
    pub bbox: Rect,
    pub score: f32,
    pub class_id: u32,
    pub feature: Option<Feature>,
    /// Cross-camera identity, filled in by the resolver.
    pub global_id: Option<u64>,
}

impl LocalTrack {
    pub fn from_detection(camera_id: SourceId, track_id: LocalTrackId, det: Detection) -> Self {
        Self {
            camera_id,
            track_id,
            bbox: det.bbox,
            score: det.score,
            class_id: det.class_id,
            feature: det.feature,
            global_id: None,
        }
    }

    /// The (camera, local id) pair that identifies this track across cycles.
    #[inline]
    pub fn key(&self) -> (SourceId, LocalTrackId) {
        (self.camera_id, self.track_id)
    }
}

/// Decoded frame shared by reference between stages.
#[derive(Debug, Clone)]
pub struct FrameImage {
    pub width: u32,
    pub height: u32,
    pub data: Arc<[u8]>,
}

impl FrameImage {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            data: data.into(),
        }
    }
}

/// A captured frame tagged with where and when it came from.
#[derive(Debug, Clone)]
pub struct SourceFrame {
    pub source_id: SourceId,
    pub frame_id: u64,
    pub timestamp: f64,
    pub image: FrameImage,
}

/// Everything one source produced for one processed frame.
#[derive(Debug, Clone)]
pub struct TrackingBatch {
    pub source_id: SourceId,
    pub frame_id: u64,
    /// Stream time in seconds.
    pub timestamp: f64,
    /// Frame dimensions used to normalise box coordinates; zero means already normalised.
    pub frame_width: u32,
    pub frame_height: u32,
    pub tracks: Vec<LocalTrack>,
    pub image: Option<FrameImage>,
}

impl TrackingBatch {
    pub fn new(
        source_id: SourceId,
        frame_id: u64,
        timestamp: f64,
        tracks: Vec<LocalTrack>,
    ) -> Self {
        Self {
            source_id,
            frame_id,
            timestamp,
            frame_width: 0,
            frame_height: 0,
            tracks,
            image: None,
        }
    }

    pub fn with_frame(mut self, image: FrameImage) -> Self {
        self.frame_width = image.width;
        self.frame_height = image.height;
        self.image = Some(image);
        self
    }

    pub fn with_frame_size(mut self, width: u32, height: u32) -> Self {
        self.frame_width = width;
        self.frame_height = height;
        self
    }
}

/// One synchronised cycle: a batch per camera, processed together by the resolver.
pub type SyncBatch = Vec<TrackingBatch>;

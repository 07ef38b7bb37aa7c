use crate::tracker::{Detection, Feature, LocalTrack, LocalTrackId, Rect, SourceId};

/// Assembles a [`LocalTrack`] from whatever box convention an external
/// tracker reports.
#[derive(Debug, Clone, Default)]
pub struct LocalTrackBuilder {
    camera_id: SourceId,
    track_id: LocalTrackId,
    bbox: Rect,
    score: f32,
    class_id: u32,
    feature: Option<Feature>,
}

impl LocalTrackBuilder {
    pub fn new(camera_id: SourceId, track_id: LocalTrackId) -> Self {
        Self {
            camera_id,
            track_id,
            ..Self::default()
        }
    }

    /// Corners: x1, y1, x2, y2.
    pub fn tlbr(mut self, x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        self.bbox = Rect::from_tlbr(x1, y1, x2, y2);
        self
    }

    /// Centre plus size.
    pub fn xywh(mut self, cx: f32, cy: f32, w: f32, h: f32) -> Self {
        self.bbox = Rect::new(cx - w * 0.5, cy - h * 0.5, w, h);
        self
    }

    /// Top-left corner plus size.
    pub fn tlwh(mut self, left: f32, top: f32, w: f32, h: f32) -> Self {
        self.bbox = Rect::new(left, top, w, h);
        self
    }

    pub fn score(mut self, score: f32) -> Self {
        self.score = score;
        self
    }

    pub fn class_id(mut self, class_id: u32) -> Self {
        self.class_id = class_id;
        self
    }

    pub fn feature(mut self, values: &[f32]) -> Self {
        self.feature = Some(Feature::from_column_slice(values));
        self
    }

    pub fn build_detection(self) -> Detection {
        Detection {
            bbox: self.bbox,
            score: self.score,
            class_id: self.class_id,
            feature: self.feature,
        }
    }

    pub fn build(self) -> LocalTrack {
        let (camera_id, track_id) = (self.camera_id, self.track_id);
        LocalTrack::from_detection(camera_id, track_id, self.build_detection())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builds_unassigned_local_track() {
        let track = LocalTrackBuilder::new(3, 12)
            .tlbr(10.0, 20.0, 50.0, 80.0)
            .score(0.95)
            .class_id(2)
            .feature(&[1.0, 0.0])
            .build();

        assert_eq!(track.key(), (3, 12));
        assert_eq!(track.class_id, 2);
        assert_eq!(track.bbox.to_tlbr(), [10.0, 20.0, 50.0, 80.0]);
        assert_eq!(track.feature.map(|f| f.len()), Some(2));
        assert_eq!(track.global_id, None);
    }

    #[test]
    fn test_box_conventions_agree() {
        let centre = LocalTrackBuilder::new(0, 1).xywh(30.0, 50.0, 40.0, 60.0).build_detection();
        let corner = LocalTrackBuilder::new(0, 1).tlwh(10.0, 20.0, 40.0, 60.0).build_detection();
        assert_eq!(centre.bbox, corner.bbox);
    }
}

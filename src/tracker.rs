mod clustering;
mod global_track;
mod local_track;
mod matching;
mod rect;
mod resolver;

pub use clustering::{average_linkage, group_by_label};
pub use global_track::GlobalTrack;
pub use local_track::{
    Detection, Feature, FrameImage, LocalTrack, LocalTrackId, SourceFrame, SourceId, SyncBatch,
    TrackingBatch,
};
pub use matching::{AssignmentResult, cosine_distance, linear_assignment};
pub use rect::Rect;
pub use resolver::{CrossCameraResolver, FusedBatch};

//! Integration module for connecting capture, detection and single-camera
//! tracking engines to the fusion core.
//!
//! The external engines plug in through [`FrameSource`], [`DetectionSource`]
//! and [`LocalTracker`]; the matching stages register with a
//! [`ProcessorFactory`](crate::worker::ProcessorFactory) so they run on the
//! same worker scaffold as the resolver.

mod builder;
mod pipeline;
mod source;

pub use builder::LocalTrackBuilder;
pub use pipeline::FusionPipeline;
pub use source::{CaptureStage, DetectStage, DetectionSource, FrameSource, LocalTracker, TrackStage};

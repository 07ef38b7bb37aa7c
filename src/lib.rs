//! Multi-camera track fusion and object lifecycle engine.
//!
//! Per-camera local tracks are fused into cross-camera identities by the
//! [`CrossCameraResolver`], folded into per-object histories by the
//! [`LifecycleHandler`], and turned into zone and connectivity events by the
//! detectors in [`events`]. Every stage runs on its own thread behind a small
//! bounded queue; [`FusionPipeline`] wires them together.

pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod integration;
pub mod lifecycle;
pub mod logging;
pub mod tracker;
pub mod worker;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use events::{Event, EventBatch, ZoneDetector};
pub use ids::IdSequence;
pub use integration::FusionPipeline;
pub use lifecycle::{LifecycleHandler, ObjectResult, ObjectState};
pub use logging::init_logging;
pub use tracker::{CrossCameraResolver, Detection, GlobalTrack, LocalTrack, Rect, TrackingBatch};
pub use worker::{BoundedQueue, WorkerArray};

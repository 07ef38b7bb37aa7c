//! Boundary traits for the external video, detection and single-camera
//! tracking engines, and the worker processors that host them.

use std::fmt::Display;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::events::ConnectivityMonitor;
use crate::tracker::{
    Detection, FrameImage, LocalTrack, LocalTrackId, SourceFrame, SourceId, TrackingBatch,
};
use crate::worker::{Packet, Processor, ProcessorParams, WorkerKind};

/// A video source: stream decoding and reconnection live behind this trait.
///
/// # Example
///
/// ```ignore
/// struct RtspCamera { /* decoder handle */ }
///
/// impl FrameSource for RtspCamera {
///     type Error = std::io::Error;
///
///     fn open(&mut self, address: &str) -> Result<(), Self::Error> { Ok(()) }
///
///     fn read(&mut self) -> Result<Option<FrameImage>, Self::Error> {
///         Ok(None)
///     }
/// }
/// ```
pub trait FrameSource: Send + 'static {
    type Error: Display;

    fn open(&mut self, address: &str) -> std::result::Result<(), Self::Error>;

    /// Next decoded frame. `Ok(None)` means no frame is ready yet.
    fn read(&mut self) -> std::result::Result<Option<FrameImage>, Self::Error>;
}

/// Trait for object detection inference backends.
pub trait DetectionSource: Send + 'static {
    type Error: Display;

    /// Run inference on raw image data and return detections.
    fn detect(
        &mut self,
        input: &[u8],
        width: u32,
        height: u32,
    ) -> std::result::Result<Vec<Detection>, Self::Error>;
}

/// A single-camera tracker assigning stable local ids to detections.
pub trait LocalTracker: Send + 'static {
    type Error: Display;

    fn update(
        &mut self,
        detections: Vec<Detection>,
    ) -> std::result::Result<Vec<(LocalTrackId, Detection)>, Self::Error>;
}

fn params_error(kind: WorkerKind, params: &ProcessorParams) -> Error {
    Error::InvalidParams {
        kind,
        reason: format!("got {:?} parameters", params.kind()),
    }
}

fn unexpected(stage: &str, packet: &Packet) -> Error {
    Error::Processing(format!("{stage} stage cannot handle {} packets", packet.name()))
}

/// Capture stage: produces frames on every idle poll.
pub struct CaptureStage<S: FrameSource> {
    source: S,
    source_id: SourceId,
    address: String,
    monitor: Option<ConnectivityMonitor>,
    next_frame: u64,
    connected: bool,
    started: Option<Instant>,
}

impl<S: FrameSource> CaptureStage<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            source_id: 0,
            address: String::new(),
            monitor: None,
            next_frame: 0,
            connected: false,
            started: None,
        }
    }

    /// Report connect/disconnect transitions to `monitor`.
    pub fn with_monitor(mut self, monitor: ConnectivityMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    fn set_connected(&mut self, connected: bool) {
        if self.connected == connected {
            return;
        }
        self.connected = connected;
        info!(
            source_id = self.source_id,
            address = %self.address,
            connected,
            "source connectivity changed"
        );
        if let Some(monitor) = &self.monitor {
            monitor.record(connected, Utc::now());
        }
    }
}

impl<S: FrameSource> Processor for CaptureStage<S> {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Capture
    }

    fn configure(&mut self, params: ProcessorParams) -> Result<()> {
        match params {
            ProcessorParams::Capture { source_id, address } => {
                self.source_id = source_id;
                self.address = address;
                Ok(())
            }
            other => Err(params_error(WorkerKind::Capture, &other)),
        }
    }

    fn init(&mut self) -> Result<()> {
        self.source
            .open(&self.address)
            .map_err(|e| Error::Processing(format!("cannot open {}: {e}", self.address)))?;
        self.started = Some(Instant::now());
        self.connected = true;
        Ok(())
    }

    fn process(&mut self, input: Packet) -> Result<Vec<Packet>> {
        Err(unexpected("capture", &input))
    }

    fn poll(&mut self) -> Result<Vec<Packet>> {
        match self.source.read() {
            Ok(Some(image)) => {
                self.set_connected(true);
                self.next_frame += 1;
                let timestamp = self.started.map_or(0.0, |t| t.elapsed().as_secs_f64());
                Ok(vec![Packet::Frame(SourceFrame {
                    source_id: self.source_id,
                    frame_id: self.next_frame,
                    timestamp,
                    image,
                })])
            }
            Ok(None) => Ok(Vec::new()),
            Err(e) => {
                self.set_connected(false);
                Err(Error::Processing(format!("read from {} failed: {e}", self.address)))
            }
        }
    }

    fn memory_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
    }
}

/// Detection stage: frame in, frame plus confident detections out.
pub struct DetectStage<D: DetectionSource> {
    detector: D,
    source_id: SourceId,
    conf_threshold: f32,
}

impl<D: DetectionSource> DetectStage<D> {
    pub fn new(detector: D) -> Self {
        Self {
            detector,
            source_id: 0,
            conf_threshold: 0.0,
        }
    }
}

impl<D: DetectionSource> Processor for DetectStage<D> {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Detect
    }

    fn configure(&mut self, params: ProcessorParams) -> Result<()> {
        match params {
            ProcessorParams::Detect {
                source_id,
                conf_threshold,
            } => {
                self.source_id = source_id;
                self.conf_threshold = conf_threshold;
                Ok(())
            }
            other => Err(params_error(WorkerKind::Detect, &other)),
        }
    }

    fn process(&mut self, input: Packet) -> Result<Vec<Packet>> {
        let frame = match input {
            Packet::Frame(frame) => frame,
            other => return Err(unexpected("detect", &other)),
        };
        let image = &frame.image;
        let mut detections = self
            .detector
            .detect(&image.data, image.width, image.height)
            .map_err(|e| {
                Error::Processing(format!("detection failed on source {}: {e}", self.source_id))
            })?;
        detections.retain(|d| d.score >= self.conf_threshold);
        debug!(
            source_id = self.source_id,
            frame_id = frame.frame_id,
            count = detections.len(),
            "detections"
        );
        Ok(vec![Packet::Detections(frame, detections)])
    }

    fn memory_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
    }
}

/// Tracking stage: detections in, a tracking batch carrying the frame out.
pub struct TrackStage<T: LocalTracker> {
    tracker: T,
    source_id: SourceId,
}

impl<T: LocalTracker> TrackStage<T> {
    pub fn new(tracker: T) -> Self {
        Self { tracker, source_id: 0 }
    }
}

impl<T: LocalTracker> Processor for TrackStage<T> {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Track
    }

    fn configure(&mut self, params: ProcessorParams) -> Result<()> {
        match params {
            ProcessorParams::Track { source_id } => {
                self.source_id = source_id;
                Ok(())
            }
            other => Err(params_error(WorkerKind::Track, &other)),
        }
    }

    fn process(&mut self, input: Packet) -> Result<Vec<Packet>> {
        let (frame, detections) = match input {
            Packet::Detections(frame, detections) => (frame, detections),
            other => return Err(unexpected("track", &other)),
        };
        let source_id = self.source_id;
        let tracks = self
            .tracker
            .update(detections)
            .map_err(|e| Error::Processing(format!("tracker failed on source {source_id}: {e}")))?
            .into_iter()
            .map(|(track_id, det)| LocalTrack::from_detection(source_id, track_id, det))
            .collect();
        let batch = TrackingBatch::new(source_id, frame.frame_id, frame.timestamp, tracks)
            .with_frame(frame.image);
        Ok(vec![Packet::Tracks(batch)])
    }

    fn memory_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
    }
}

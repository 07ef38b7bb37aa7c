//! The processing unit hosted by each worker, and the factory that builds them.

use std::collections::HashMap;

use crate::config::ResolverConfig;
use crate::error::{Error, Result};
use crate::tracker::{
    CrossCameraResolver, Detection, FusedBatch, SourceFrame, SourceId, SyncBatch, TrackingBatch,
};

/// Type tag for the processors a worker array can host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    Capture,
    Detect,
    Track,
    MultiCameraTrack,
}

/// Per-worker settings, one variant per kind.
#[derive(Debug, Clone)]
pub enum ProcessorParams {
    Capture { source_id: SourceId, address: String },
    Detect { source_id: SourceId, conf_threshold: f32 },
    Track { source_id: SourceId },
    MultiCameraTrack(ResolverConfig),
}

impl ProcessorParams {
    pub fn kind(&self) -> WorkerKind {
        match self {
            Self::Capture { .. } => WorkerKind::Capture,
            Self::Detect { .. } => WorkerKind::Detect,
            Self::Track { .. } => WorkerKind::Track,
            Self::MultiCameraTrack(_) => WorkerKind::MultiCameraTrack,
        }
    }
}

/// Data travelling between stages.
#[derive(Debug, Clone)]
pub enum Packet {
    Frame(SourceFrame),
    Detections(SourceFrame, Vec<Detection>),
    Tracks(TrackingBatch),
    Synchronized(SyncBatch),
    Fused(FusedBatch),
}

impl Packet {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Frame(_) => "frame",
            Self::Detections(..) => "detections",
            Self::Tracks(_) => "tracks",
            Self::Synchronized(_) => "synchronized",
            Self::Fused(_) => "fused",
        }
    }
}

/// One stage implementation. A worker owns exactly one processor and calls it
/// from its own thread only.
pub trait Processor: Send + 'static {
    fn kind(&self) -> WorkerKind;

    fn configure(&mut self, params: ProcessorParams) -> Result<()>;

    /// Acquire resources (open streams, load models). Called once before start.
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn process(&mut self, input: Packet) -> Result<Vec<Packet>>;

    /// Called when a poll interval passes without input. Source stages produce here.
    fn poll(&mut self) -> Result<Vec<Packet>> {
        Ok(Vec::new())
    }

    fn release(&mut self) {}

    /// Approximate bytes held, for memory snapshots.
    fn memory_bytes(&self) -> usize;
}

/// Builds a processor for the worker with the given index.
pub type ProcessorCtor = Box<dyn Fn(usize) -> Box<dyn Processor> + Send + Sync>;

/// Processor constructors keyed by worker kind.
#[derive(Default)]
pub struct ProcessorFactory {
    ctors: HashMap<WorkerKind, ProcessorCtor>,
}

impl ProcessorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory that already knows how to build the cross-camera resolver.
    /// Capture, detect and track stages wrap external engines and are
    /// registered by the integrator.
    pub fn with_builtin() -> Self {
        let mut factory = Self::new();
        factory.register(WorkerKind::MultiCameraTrack, |_| {
            Box::new(CrossCameraResolver::new(ResolverConfig::default()))
        });
        factory
    }

    pub fn register<F>(&mut self, kind: WorkerKind, ctor: F) -> &mut Self
    where
        F: Fn(usize) -> Box<dyn Processor> + Send + Sync + 'static,
    {
        self.ctors.insert(kind, Box::new(ctor));
        self
    }

    pub fn create(&self, kind: WorkerKind, id: usize) -> Result<Box<dyn Processor>> {
        let ctor = self.ctors.get(&kind).ok_or(Error::UnknownKind(kind))?;
        Ok(ctor(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_factory_builds_resolver() {
        let factory = ProcessorFactory::with_builtin();
        let processor = factory.create(WorkerKind::MultiCameraTrack, 0).unwrap();
        assert_eq!(processor.kind(), WorkerKind::MultiCameraTrack);
    }

    #[test]
    fn test_unknown_kind_is_an_error() {
        let factory = ProcessorFactory::with_builtin();
        assert!(matches!(
            factory.create(WorkerKind::Capture, 0),
            Err(Error::UnknownKind(WorkerKind::Capture))
        ));
    }

    #[test]
    fn test_resolver_rejects_foreign_params() {
        let factory = ProcessorFactory::with_builtin();
        let mut processor = factory.create(WorkerKind::MultiCameraTrack, 0).unwrap();
        let err = processor.configure(ProcessorParams::Track { source_id: 0 }).unwrap_err();
        assert!(matches!(err, Error::InvalidParams { .. }));
    }
}

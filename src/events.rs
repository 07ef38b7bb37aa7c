//! Derived events: zone entry/exit and camera connectivity, merged by the aggregator.

mod aggregator;
mod connectivity;
mod event;
mod zone;
mod zone_detector;

pub use aggregator::{Aggregator, DetectorOutput, EventDetector};
pub use connectivity::{CONNECTIVITY_DETECTOR, ConnectivityDetector, ConnectivityMonitor};
pub use event::{CameraEvent, Event, EventBatch, Severity, ZoneEvent};
pub use zone::{Zone, ZoneShape};
pub use zone_detector::{ZoneDetector, ZoneIdSequences, ZoneRequest};

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::events::zone::Zone;
use crate::lifecycle::ObjectResultHistory;
use crate::tracker::SourceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// An object's stay in a zone. Opened on confirmed entry, closed on exit.
#[derive(Debug, Clone)]
pub struct ZoneEvent {
    pub event_id: u64,
    pub zone: Zone,
    pub object_id: u64,
    pub entry: ObjectResultHistory,
    pub exit: Option<ObjectResultHistory>,
    /// Stream time of the first frame inside the zone.
    pub time_entered: f64,
    pub time_left: Option<f64>,
    pub finished: bool,
}

impl ZoneEvent {
    pub fn source_id(&self) -> SourceId {
        self.zone.source_id
    }

    pub fn dwell_time(&self) -> Option<f64> {
        self.time_left.map(|left| left - self.time_entered)
    }
}

/// A connect or disconnect transition of one source.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraEvent {
    pub source_id: SourceId,
    pub address: String,
    pub connected: bool,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
}

#[derive(Debug, Clone)]
pub enum Event {
    Zone(ZoneEvent),
    Camera(CameraEvent),
}

/// Events of one aggregation cycle keyed by detector name.
pub type EventBatch = BTreeMap<String, Vec<Event>>;

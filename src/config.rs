//! Engine configuration.
//!
//! Loaded from an optional TOML file with environment overrides in the form
//! `CROSSTRACK__SECTION__KEY` (double underscore separators).

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::events::ZoneShape;
use crate::tracker::SourceId;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub resolver: ResolverConfig,
    pub lifecycle: LifecycleConfig,
    pub zones: ZoneConfig,
    pub workers: WorkerConfig,
    pub zone_definitions: Vec<ZoneDefinition>,
}

/// Cross-camera identity resolution.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Dendrogram cut height and maximum appearance distance for re-association.
    pub clustering_threshold: f64,
    /// Overlap ratio above which a detection contributes no feature sample.
    pub overlap_threshold: f32,
    /// Capacity of each global track's rolling feature buffer.
    pub feature_buffer_len: usize,
    /// Run the reap pass every this many cycles.
    pub reap_interval: u64,
    /// A global track invisible for longer than this many cycles is purged.
    pub max_invisible_cycles: u64,
}

impl ResolverConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.clustering_threshold) {
            return Err(invalid("resolver.clustering_threshold must lie in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.overlap_threshold) {
            return Err(invalid("resolver.overlap_threshold must lie in [0, 1]"));
        }
        if self.feature_buffer_len == 0 {
            return Err(invalid("resolver.feature_buffer_len must be at least 1"));
        }
        if self.reap_interval == 0 {
            return Err(invalid("resolver.reap_interval must be at least 1"));
        }
        Ok(())
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            clustering_threshold: 0.5,
            overlap_threshold: 0.5,
            feature_buffer_len: 200,
            reap_interval: 100,
            max_invisible_cycles: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub history_len: usize,
    /// Consecutive missed cycles before an active object is declared lost.
    pub lost_thresh: u32,
    pub lost_capacity: usize,
    pub sink_retries: u32,
    pub dead_letter_capacity: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            history_len: 64,
            lost_thresh: 30,
            lost_capacity: 1024,
            sink_retries: 3,
            dead_letter_capacity: 256,
        }
    }
}

/// How the zone detector searches an object's history for transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchStrategy {
    /// Assumes containment is monotone over the searched window.
    #[default]
    Binary,
    /// Walks the history in order; safe for irregular trajectories.
    Linear,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ZoneConfig {
    /// Dwell time in seconds before an entry is confirmed.
    pub event_threshold: f64,
    pub search: SearchStrategy,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            event_threshold: 1.0,
            search: SearchStrategy::Binary,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub queue_capacity: usize,
    pub output_capacity: usize,
    pub poll_interval_ms: u64,
    pub join_timeout_ms: u64,
    pub error_backoff_ms: u64,
    pub connectivity_poll_ms: u64,
    pub aggregator_poll_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 2,
            output_capacity: 64,
            poll_interval_ms: 50,
            join_timeout_ms: 2000,
            error_backoff_ms: 10,
            connectivity_poll_ms: 200,
            aggregator_poll_ms: 10,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

/// A zone declared up front for one source, in normalised image coordinates.
#[derive(Debug, Clone, Deserialize)]
pub struct ZoneDefinition {
    pub source_id: SourceId,
    pub shape: ZoneShape,
    pub coords: Vec<(f32, f32)>,
}

impl EngineConfig {
    /// Load from an optional TOML file, then apply `CROSSTRACK__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let cfg: EngineConfig = builder
            .add_source(config::Environment::with_prefix("CROSSTRACK").separator("__"))
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let cfg: EngineConfig = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        self.resolver.validate()?;
        if self.lifecycle.history_len == 0 {
            return Err(invalid("lifecycle.history_len must be at least 1"));
        }
        if self.lifecycle.lost_thresh == 0 {
            return Err(invalid("lifecycle.lost_thresh must be at least 1"));
        }
        if self.zones.event_threshold < 0.0 {
            return Err(invalid("zones.event_threshold must not be negative"));
        }
        if self.workers.queue_capacity == 0 || self.workers.output_capacity == 0 {
            return Err(invalid("worker queue capacities must be at least 1"));
        }
        for def in &self.zone_definitions {
            def.shape.check_vertices(def.coords.len())?;
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> Error {
    Error::InvalidConfig(msg.to_string())
}

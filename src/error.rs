//! Crate-wide error type.

use thiserror::Error;

use crate::worker::{WorkerKind, WorkerState};

/// Errors surfaced by the fusion engine.
///
/// A full queue is not an error: it is reported through the
/// `bool` returned by `put`, never through this type.
#[derive(Debug, Error)]
pub enum Error {
    /// `configure` received a parameter list whose length differs from the worker count.
    #[error("expected {expected} parameter sets, got {got}")]
    ParamCountMismatch { expected: usize, got: usize },

    /// An operational method was called before the component was initialised.
    #[error("{0} used before initialisation")]
    NotInitialized(&'static str),

    /// A worker lifecycle method was called out of order.
    #[error("worker {id} cannot {operation} while {state:?}")]
    InvalidState {
        id: usize,
        operation: &'static str,
        state: WorkerState,
    },

    /// A processor was handed parameters meant for another worker kind.
    #[error("{kind:?} processor rejected parameters: {reason}")]
    InvalidParams { kind: WorkerKind, reason: String },

    /// The factory has no constructor for the requested kind.
    #[error("no processor registered for {0:?}")]
    UnknownKind(WorkerKind),

    #[error("failed to spawn thread `{name}`")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("zone needs at least {min} vertices, got {got}")]
    InvalidZone { min: usize, got: usize },

    /// The external persistence sink refused a notification.
    #[error("sink delivery failed: {0}")]
    Sink(String),

    /// A single processing step failed; the worker logs it and carries on.
    #[error("processing failed: {0}")]
    Processing(String),
}

pub type Result<T> = std::result::Result<T, Error>;

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic id issuer. Ids start at 1 and are never handed out twice.
///
/// Each registry owns its own sequence; share one across threads behind an `Arc`.
#[derive(Debug, Default)]
pub struct IdSequence {
    last: AtomicU64,
}

impl IdSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the next unique id.
    pub fn next_id(&self) -> u64 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The most recently issued id, 0 if none yet.
    pub fn last_issued(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}

//! Delivery of lifecycle notifications to the external persistence layer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Sender, TrySendError};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::lifecycle::object::ObjectResultHistory;
use crate::tracker::SourceId;
use crate::worker::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Created,
    Updated,
}

#[derive(Debug, Clone)]
pub struct LifecycleNotification {
    pub kind: NotificationKind,
    pub object_id: u64,
    pub source_id: SourceId,
    pub snapshot: ObjectResultHistory,
}

/// Receiver of lifecycle notifications (database writer, message bus, ...).
pub trait LifecycleSink: Send + Sync {
    fn deliver(&self, notification: &LifecycleNotification) -> Result<()>;
}

/// Forwards notifications into a channel without blocking.
pub struct ChannelSink {
    tx: Sender<LifecycleNotification>,
}

impl ChannelSink {
    pub fn new(tx: Sender<LifecycleNotification>) -> Self {
        Self { tx }
    }
}

impl LifecycleSink for ChannelSink {
    fn deliver(&self, notification: &LifecycleNotification) -> Result<()> {
        match self.tx.try_send(notification.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Error::Sink("channel full".into())),
            Err(TrySendError::Disconnected(_)) => Err(Error::Sink("receiver dropped".into())),
        }
    }
}

/// Delivers to a sink with bounded retries; notifications that still fail are
/// parked in a bounded dead-letter queue, oldest evicted first.
pub struct SinkDispatcher {
    sink: Arc<dyn LifecycleSink>,
    retries: u32,
    dead_letters: Mutex<VecDeque<LifecycleNotification>>,
    dead_letter_capacity: usize,
}

impl SinkDispatcher {
    pub fn new(sink: Arc<dyn LifecycleSink>, retries: u32, dead_letter_capacity: usize) -> Self {
        Self {
            sink,
            retries,
            dead_letters: Mutex::new(VecDeque::new()),
            dead_letter_capacity,
        }
    }

    pub fn dispatch(&self, notifications: Vec<LifecycleNotification>) {
        for notification in notifications {
            if let Err(e) = self.deliver_with_retry(&notification) {
                warn!(
                    object_id = notification.object_id,
                    kind = ?notification.kind,
                    error = %e,
                    "notification dead-lettered"
                );
                self.park(notification);
            }
        }
    }

    fn deliver_with_retry(&self, notification: &LifecycleNotification) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.sink.deliver(notification) {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.retries => return Err(e),
                Err(e) => {
                    attempt += 1;
                    debug!(
                        object_id = notification.object_id,
                        attempt,
                        error = %e,
                        "sink delivery retry"
                    );
                }
            }
        }
    }

    fn park(&self, notification: LifecycleNotification) {
        if self.dead_letter_capacity == 0 {
            return;
        }
        let mut letters = lock(&self.dead_letters);
        if letters.len() == self.dead_letter_capacity {
            letters.pop_front();
        }
        letters.push_back(notification);
    }

    pub fn dead_letter_count(&self) -> usize {
        lock(&self.dead_letters).len()
    }

    pub fn drain_dead_letters(&self) -> Vec<LifecycleNotification> {
        lock(&self.dead_letters).drain(..).collect()
    }
}

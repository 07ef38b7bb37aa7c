//! Bounded stage queue with a poison-pill sentinel.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::worker::runner::Waker;

enum Message<T> {
    Item(T),
    Stop,
}

/// Result of a blocking dequeue.
#[derive(Debug, PartialEq, Eq)]
pub enum Recv<T> {
    Item(T),
    /// Nothing arrived within the timeout.
    Timeout,
    /// The poison pill was received, or every producer is gone.
    Stopped,
}

/// Fixed-capacity queue between two stages.
///
/// `put` never blocks: on a full queue it returns `false` and the caller
/// decides whether to drop or retry.
pub struct BoundedQueue<T> {
    tx: Sender<Message<T>>,
    rx: Receiver<Message<T>>,
    capacity: usize,
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T> BoundedQueue<T> {
    /// A zero capacity is raised to one; a rendezvous channel would make `put` always fail.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self { tx, rx, capacity }
    }

    pub fn put(&self, item: T) -> bool {
        self.tx.try_send(Message::Item(item)).is_ok()
    }

    pub fn get(&self, timeout: Duration) -> Recv<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(Message::Item(item)) => Recv::Item(item),
            Ok(Message::Stop) | Err(RecvTimeoutError::Disconnected) => Recv::Stopped,
            Err(RecvTimeoutError::Timeout) => Recv::Timeout,
        }
    }

    /// Non-blocking dequeue. A pending poison pill is consumed and reported as `None`.
    pub fn try_get(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(Message::Item(item)) => Some(item),
            Ok(Message::Stop) | Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Push the sentinel, waiting at most `wait` for a free slot.
    ///
    /// A consumer parked in `get` sees an empty queue, so the push succeeds
    /// immediately in the case that matters.
    pub fn poison(&self, wait: Duration) -> bool {
        self.tx.send_timeout(Message::Stop, wait).is_ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T: Send + 'static> BoundedQueue<T> {
    /// Closure that poisons this queue, for
    /// [`WorkerThread::stop`](crate::worker::WorkerThread::stop).
    pub fn waker(&self) -> Waker {
        let queue = self.clone();
        Box::new(move || {
            queue.poison(Duration::from_millis(50));
        })
    }
}

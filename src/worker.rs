//! Staged worker scaffold.
//!
//! Every stage in the engine runs on its own OS thread, fed by a small bounded
//! queue. Shutdown always goes through [`WorkerThread::stop`]: clear the run
//! flag, push a poison pill (or raise a signal) to unblock the thread, then
//! join with a bounded wait.

mod array;
mod processor;
mod queue;
mod runner;
mod signal;

pub use array::{Worker, WorkerArray, WorkerState};
pub use processor::{
    Packet, Processor, ProcessorCtor, ProcessorFactory, ProcessorParams, WorkerKind,
};
pub use queue::{BoundedQueue, Recv};
pub use runner::{
    LoopTiming, RunFlag, Waker, WorkerThread, run_consumer_loop, run_polling_loop, run_signal_loop,
};
pub use signal::ManualResetEvent;

pub(crate) use runner::lock;

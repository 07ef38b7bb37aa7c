mod handler;
mod object;
mod registry;
mod sink;

pub use handler::{LifecycleHandle, LifecycleHandler, ObjectSnapshots};
pub use object::{ObjectResult, ObjectResultHistory, ObjectState};
pub use registry::ObjectRegistry;
pub use sink::{ChannelSink, LifecycleNotification, LifecycleSink, NotificationKind, SinkDispatcher};

//! Event sinks consuming classification changes.

mod recorder;
mod report;

pub use recorder::*;
pub use report::*;

use thiserror::Error;

use crate::tracker::ActivityEvent;

/// Sink error types.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sink closed")]
    Closed,
    #[error("sink lock poisoned")]
    LockPoisoned,
}

/// Receives events in emission order.
///
/// Publishing is fire-and-forget from the scheduler's point of view, but a
/// sink must report a failure rather than silently drop the event.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &ActivityEvent) -> Result<(), SinkError>;
}

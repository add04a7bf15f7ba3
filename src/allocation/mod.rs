//! Hand-off of allocated devices from the device plugin service to the background
//! worker that attaches the vcan interface once the container is running.
use tokio::sync::mpsc;

mod dispatcher;
mod retry;

pub use dispatcher::{Dispatcher, Report, Summary, summarize};
pub use retry::{AbandonReason, Outcome, RetryPolicy, resolve_and_attach};
#[cfg(test)]
pub(crate) use retry::testing;

/// Capacity of the allocation queue. Senders wait while it is full, so a burst of
/// allocations stalls the `Allocate` handler until the dispatcher catches up.
pub const QUEUE_CAPACITY: usize = 1;

/// One device handed to one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub device_id: String,
    /// Path of the device inside the container, used to find the container.
    pub container_path: String,
}

pub type Sender = mpsc::Sender<Allocation>;
pub type Receiver = mpsc::Receiver<Allocation>;

/// Creates the allocation queue.
pub fn channel() -> (Sender, Receiver) {
    mpsc::channel(QUEUE_CAPACITY)
}

//! Bounded producer/consumer pipeline between the render loop and the sinks.

pub mod ringbuf;
mod semaphore;
pub mod shutdown;
pub mod signal;
pub(crate) mod worker;

pub use ringbuf::{
    frame_queue, Claim, ClaimedFrame, FrameConsumer, FrameProducer, Occupancy, QueueMonitor,
    QueueStats,
};
pub use semaphore::Wait;
pub use shutdown::ShutdownProtocol;
pub use signal::{CancelToken, FailureSignal};
pub use worker::WorkerExit;

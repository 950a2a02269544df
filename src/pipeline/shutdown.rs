//! Graceful termination of a capture session.
//!
//! Two protocols, picked by the sink's ordering:
//!
//! - [`ShutdownProtocol::EndOfStream`]: one worker. A single sentinel goes
//!   through the normal enqueue path behind the last frame, so the worker
//!   exits exactly when everything before it has been written.
//! - [`ShutdownProtocol::Broadcast`]: a pool of workers. Termination is a
//!   flag plus one wake-up per worker; workers keep claiming frames until the
//!   queue is empty and pass their wake-up on when they leave.
//!
//! In both cases the queue is only dropped after every worker was joined,
//! and the sink is finished last.

use tracing::{debug, info, warn};

use crate::error::CaptureError;
use crate::pipeline::ringbuf::{FrameConsumer, FrameProducer};
use crate::pipeline::signal::FailureSignal;
use crate::pipeline::worker::WorkerPool;
use crate::sink::{FrameSink, SinkOrdering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownProtocol {
    EndOfStream,
    Broadcast,
}

impl ShutdownProtocol {
    pub fn for_ordering(ordering: SinkOrdering) -> Self {
        match ordering {
            SinkOrdering::Ordered => Self::EndOfStream,
            SinkOrdering::Unordered => Self::Broadcast,
        }
    }
}

pub(crate) struct ShutdownCoordinator<'a> {
    pub protocol: ShutdownProtocol,
    pub sink: &'a dyn FrameSink,
    pub signal: &'a FailureSignal,
}

impl ShutdownCoordinator<'_> {
    /// Drains and joins the pool, then finishes the sink. The pool is left
    /// empty but readable for its counters.
    ///
    /// If the session failed at any point, the first failure is returned
    /// even when draining and finishing succeed.
    pub fn run(
        &self,
        mut producer: FrameProducer,
        consumer: FrameConsumer,
        pool: &mut WorkerPool,
    ) -> Result<(), CaptureError> {
        if !self.signal.is_failed() {
            match self.protocol {
                ShutdownProtocol::EndOfStream => {
                    // Fails only if the session died while the queue was full.
                    if let Err(err) = producer.enqueue_end_of_stream() {
                        debug!("end of stream not queued: {err}");
                    }
                }
                ShutdownProtocol::Broadcast => consumer.begin_termination(pool.len()),
            }
        }

        let joined = pool.join_all();
        debug!(workers = pool.len(), "all workers joined");
        drop(producer);
        drop(consumer);

        let finished = self.sink.finish();

        if let Some(cause) = self.signal.cause() {
            if let Err(err) = finished {
                warn!(sink = self.sink.name(), "finishing failed sink: {err}");
            }
            return Err(CaptureError::Aborted(cause));
        }
        joined?;
        finished.map_err(|source| CaptureError::Finalize {
            what: format!("sink '{}'", self.sink.name()),
            source,
        })?;

        info!(sink = self.sink.name(), "capture finalized");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Frame, FrameId};
    use crate::error::{ErrorKind, SinkError};
    use crate::pipeline::ringbuf::frame_queue;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    struct OrderedSink {
        bytes: Mutex<Vec<u8>>,
        finished: AtomicBool,
        finish_fails: bool,
    }

    impl OrderedSink {
        fn new(finish_fails: bool) -> Self {
            Self {
                bytes: Mutex::new(Vec::new()),
                finished: AtomicBool::new(false),
                finish_fails,
            }
        }
    }

    impl FrameSink for OrderedSink {
        fn name(&self) -> &str {
            "ordered"
        }

        fn ordering(&self) -> SinkOrdering {
            SinkOrdering::Ordered
        }

        fn write(&self, _id: FrameId, payload: &[u8]) -> Result<(), SinkError> {
            self.bytes.lock().unwrap().extend_from_slice(payload);
            Ok(())
        }

        fn finish(&self) -> Result<(), SinkError> {
            self.finished.store(true, Ordering::SeqCst);
            if self.finish_fails {
                Err(SinkError::custom("encoder exited with 1"))
            } else {
                Ok(())
            }
        }
    }

    fn run(sink: &Arc<OrderedSink>, frames: u64) -> Result<(), CaptureError> {
        let signal = Arc::new(FailureSignal::new());
        let (mut producer, consumer) = frame_queue(2, 1, Arc::clone(&signal)).unwrap();
        let shared: Arc<dyn FrameSink> = sink.clone();
        let mut pool = WorkerPool::spawn(1, &consumer, shared, Arc::clone(&signal)).unwrap();

        for id in 0..frames {
            producer
                .enqueue(&Frame::new(FrameId(id), vec![id as u8]))
                .unwrap();
        }

        ShutdownCoordinator {
            protocol: ShutdownProtocol::EndOfStream,
            sink: sink.as_ref(),
            signal: &signal,
        }
        .run(producer, consumer, &mut pool)
    }

    #[test]
    fn test_protocol_for_ordering() {
        assert_eq!(
            ShutdownProtocol::for_ordering(SinkOrdering::Ordered),
            ShutdownProtocol::EndOfStream
        );
        assert_eq!(
            ShutdownProtocol::for_ordering(SinkOrdering::Unordered),
            ShutdownProtocol::Broadcast
        );
    }

    #[test]
    fn test_end_of_stream_drains_everything() {
        let sink = Arc::new(OrderedSink::new(false));
        run(&sink, 10).unwrap();

        assert!(sink.finished.load(Ordering::SeqCst));
        assert_eq!(*sink.bytes.lock().unwrap(), (0..10).collect::<Vec<u8>>());
    }

    #[test]
    fn test_finish_failure_is_finalize_error() {
        let sink = Arc::new(OrderedSink::new(true));
        let err = run(&sink, 3).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Finalize);
    }
}

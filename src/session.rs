//! Capture session management.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, instrument, warn};

use crate::capture::{Frame, FrameId, FrameLayout, PixelSource};
use crate::error::CaptureError;
use crate::pipeline::shutdown::ShutdownCoordinator;
use crate::pipeline::worker::WorkerPool;
use crate::pipeline::{
    frame_queue, FailureSignal, FrameConsumer, FrameProducer, Occupancy, QueueMonitor,
    ShutdownProtocol,
};
use crate::sink::FrameSink;
use crate::PipelineConfig;

/// Statistics about a capture session.
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    /// Frames accepted by the queue.
    pub frames_published: u64,
    /// Frames the sink persisted.
    pub frames_written: u64,
    /// Times the producer found the queue full.
    pub producer_stalls: u64,
    pub workers: usize,
    pub elapsed: Duration,
}

struct Running {
    producer: FrameProducer,
    consumer: FrameConsumer,
    pool: WorkerPool,
}

/// Handle to a running capture.
///
/// Owns the frame queue, the worker pool, the sink and the failure signal.
/// The render loop calls [`publish`](Self::publish) once per frame, then
/// [`finish`](Self::finish) to drain everything into the sink.
///
/// # Lifecycle
///
/// 1. Created by [`CaptureSession::start`], which spawns the workers
/// 2. Frames are published from a single thread
/// 3. [`finish`](Self::finish) drains the queue and finalizes the sink, or
///    [`abort`](Self::abort) tears everything down after a producer-side error
/// 4. Dropping an unfinished session cancels and joins its workers
pub struct CaptureSession {
    running: Option<Running>,
    sink: Arc<dyn FrameSink>,
    signal: Arc<FailureSignal>,
    protocol: ShutdownProtocol,
    monitor: QueueMonitor,
    workers: usize,
    published: u64,
    started: Instant,
}

impl CaptureSession {
    /// Allocates the queue and spawns the workers for `sink`.
    ///
    /// The worker count comes from `config`, except that ordered sinks
    /// always get exactly one.
    #[instrument(skip_all, fields(sink = sink.name()))]
    pub fn start(
        config: &PipelineConfig,
        layout: FrameLayout,
        sink: Arc<dyn FrameSink>,
    ) -> Result<Self, CaptureError> {
        let ordering = sink.ordering();
        let workers = config.effective_workers(ordering);
        if workers == 0 {
            return Err(CaptureError::Config("worker count must be positive".into()));
        }

        let signal = Arc::new(FailureSignal::new());
        let (producer, consumer) =
            frame_queue(config.queue_capacity, layout.frame_size(), Arc::clone(&signal))?;
        let monitor = producer.monitor();

        let pool = match WorkerPool::spawn(workers, &consumer, Arc::clone(&sink), Arc::clone(&signal)) {
            Ok(pool) => pool,
            Err(err) => {
                if let Err(finish_err) = sink.finish() {
                    warn!("closing sink after failed start: {finish_err}");
                }
                return Err(err);
            }
        };

        let protocol = ShutdownProtocol::for_ordering(ordering);
        info!(
            capacity = config.queue_capacity,
            workers,
            ?protocol,
            width = layout.width,
            height = layout.height,
            "capture session started"
        );

        Ok(Self {
            running: Some(Running {
                producer,
                consumer,
                pool,
            }),
            sink,
            signal,
            protocol,
            monitor,
            workers,
            published: 0,
            started: Instant::now(),
        })
    }

    /// Captures frame `id` from `source` straight into the queue.
    ///
    /// Blocks while the queue is full. Once any worker has failed this
    /// returns [`CaptureError::Aborted`] carrying the first failure.
    pub fn publish<S>(&mut self, id: FrameId, source: &mut S) -> Result<(), CaptureError>
    where
        S: PixelSource + ?Sized,
    {
        self.producer()?.publish(id, source)?;
        self.record_published();
        Ok(())
    }

    /// Copies an already captured frame into the queue.
    pub fn enqueue(&mut self, frame: &Frame) -> Result<(), CaptureError> {
        self.producer()?.enqueue(frame)?;
        self.record_published();
        Ok(())
    }

    pub fn is_failed(&self) -> bool {
        self.signal.is_failed()
    }

    pub fn failure_signal(&self) -> &Arc<FailureSignal> {
        &self.signal
    }

    pub fn protocol(&self) -> ShutdownProtocol {
        self.protocol
    }

    pub fn occupancy(&self) -> Occupancy {
        self.monitor.occupancy()
    }

    pub fn stats(&self) -> SessionStats {
        let written = self
            .running
            .as_ref()
            .map_or(0, |running| running.pool.frames_written());
        self.stats_with(written)
    }

    /// Drains every published frame into the sink and finalizes it.
    #[instrument(skip_all, fields(sink = self.sink.name()))]
    pub fn finish(mut self) -> Result<SessionStats, CaptureError> {
        let stats = self.shutdown()?;
        info!(
            published = stats.frames_published,
            written = stats.frames_written,
            stalls = stats.producer_stalls,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "capture session finished"
        );
        Ok(stats)
    }

    /// Fails the session with `err`, tears it down and returns the error to
    /// report. If a worker had already failed, that earlier cause wins.
    pub fn abort(mut self, err: CaptureError) -> CaptureError {
        self.signal.fail(err);
        match self.shutdown() {
            Err(err) => err,
            Ok(_) => self.signal.aborted(),
        }
    }

    fn producer(&mut self) -> Result<&mut FrameProducer, CaptureError> {
        self.running
            .as_mut()
            .map(|running| &mut running.producer)
            .ok_or_else(|| CaptureError::Usage("capture session already shut down".into()))
    }

    fn record_published(&mut self) {
        self.published += 1;
        metrics::counter!("framepipe_frames_published").increment(1);
    }

    fn stats_with(&self, frames_written: u64) -> SessionStats {
        SessionStats {
            frames_published: self.published,
            frames_written,
            producer_stalls: self.monitor.stats().producer_stalls,
            workers: self.workers,
            elapsed: self.started.elapsed(),
        }
    }

    fn shutdown(&mut self) -> Result<SessionStats, CaptureError> {
        let Some(Running {
            producer,
            consumer,
            mut pool,
        }) = self.running.take()
        else {
            return Err(CaptureError::Usage("capture session already shut down".into()));
        };

        let coordinator = ShutdownCoordinator {
            protocol: self.protocol,
            sink: self.sink.as_ref(),
            signal: &self.signal,
        };
        coordinator.run(producer, consumer, &mut pool)?;
        Ok(self.stats_with(pool.frames_written()))
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        let Some(mut running) = self.running.take() else {
            return;
        };

        // Dropped without finish() or abort(): stop the workers.
        warn!(sink = self.sink.name(), "capture session dropped while running");
        self.signal.fail(CaptureError::Interrupted);
        if let Err(err) = running.pool.join_all() {
            warn!("joining workers on drop: {err}");
        }
        drop(running);
        if let Err(err) = self.sink.finish() {
            warn!(sink = self.sink.name(), "finishing sink on drop: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, SinkError};
    use crate::sink::SinkOrdering;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    struct CountingSink {
        ordering: SinkOrdering,
        writes: AtomicU64,
        finished: AtomicBool,
    }

    impl CountingSink {
        fn new(ordering: SinkOrdering) -> Arc<Self> {
            Arc::new(Self {
                ordering,
                writes: AtomicU64::new(0),
                finished: AtomicBool::new(false),
            })
        }
    }

    impl FrameSink for CountingSink {
        fn name(&self) -> &str {
            "counting"
        }

        fn ordering(&self) -> SinkOrdering {
            self.ordering
        }

        fn write(&self, _id: FrameId, _payload: &[u8]) -> Result<(), SinkError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn finish(&self) -> Result<(), SinkError> {
            self.finished.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn layout() -> FrameLayout {
        FrameLayout::new(4, 2, crate::capture::PixelFormat::Rgb24)
    }

    fn config(workers: usize) -> PipelineConfig {
        PipelineConfig {
            queue_capacity: 4,
            workers,
        }
    }

    #[test]
    fn test_ordered_sink_gets_one_worker() {
        let sink = CountingSink::new(SinkOrdering::Ordered);
        let session = CaptureSession::start(&config(8), layout(), sink).unwrap();

        assert_eq!(session.stats().workers, 1);
        assert_eq!(session.protocol(), ShutdownProtocol::EndOfStream);
        session.finish().unwrap();
    }

    #[test]
    fn test_finish_reports_stats() {
        let sink = CountingSink::new(SinkOrdering::Unordered);
        let mut session =
            CaptureSession::start(&config(3), layout(), sink.clone()).unwrap();
        assert_eq!(session.protocol(), ShutdownProtocol::Broadcast);

        let mut source = crate::capture::TestPattern::new(layout());
        for id in 0..20 {
            session.publish(FrameId(id), &mut source).unwrap();
        }
        let stats = session.finish().unwrap();

        assert_eq!(stats.frames_published, 20);
        assert_eq!(stats.frames_written, 20);
        assert_eq!(stats.workers, 3);
        assert_eq!(sink.writes.load(Ordering::SeqCst), 20);
        assert!(sink.finished.load(Ordering::SeqCst));
    }

    #[test]
    fn test_abort_returns_cause() {
        let sink = CountingSink::new(SinkOrdering::Unordered);
        let session = CaptureSession::start(&config(2), layout(), sink.clone()).unwrap();

        let err = session.abort(CaptureError::Usage("render loop crashed".into()));
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert!(sink.finished.load(Ordering::SeqCst));
    }

    #[test]
    fn test_drop_cancels_workers() {
        let sink = CountingSink::new(SinkOrdering::Unordered);
        let session = CaptureSession::start(&config(4), layout(), sink.clone()).unwrap();
        let signal = Arc::clone(session.failure_signal());

        drop(session);
        assert_eq!(signal.cause().unwrap().kind(), ErrorKind::Interrupted);
        assert!(sink.finished.load(Ordering::SeqCst));
    }

    #[test]
    fn test_zero_workers_is_config_error() {
        let sink = CountingSink::new(SinkOrdering::Unordered);
        let err = CaptureSession::start(&config(0), layout(), sink).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}

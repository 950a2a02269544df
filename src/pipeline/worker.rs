//! Sink worker threads draining the frame queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, warn};

use crate::error::CaptureError;
use crate::pipeline::ringbuf::{Claim, FrameConsumer};
use crate::pipeline::signal::FailureSignal;
use crate::sink::FrameSink;

/// Why a worker left its loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Saw the end-of-stream sentinel or the termination broadcast.
    Drained,
    /// The session failed elsewhere.
    Cancelled,
    /// This worker's sink write failed.
    Failed,
}

struct Worker {
    index: usize,
    consumer: FrameConsumer,
    sink: Arc<dyn FrameSink>,
    signal: Arc<FailureSignal>,
    written: Arc<AtomicU64>,
}

impl Worker {
    fn run(self) -> WorkerExit {
        debug!(worker = self.index, "worker started");
        let mut written = 0u64;

        let exit = loop {
            match self.consumer.dequeue() {
                Claim::Frame(frame) => {
                    let started = Instant::now();
                    if let Err(source) = self.sink.write(frame.id(), frame.payload()) {
                        // Fail before freeing the slot so the producer cannot
                        // slip another frame in ahead of the failure.
                        self.signal.fail(CaptureError::Write {
                            sink: self.sink.name().to_string(),
                            frame: frame.id(),
                            source,
                        });
                        drop(frame);
                        break WorkerExit::Failed;
                    }
                    drop(frame);

                    written += 1;
                    self.written.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("framepipe_frames_written").increment(1);
                    metrics::histogram!("framepipe_sink_write_us")
                        .record(started.elapsed().as_micros() as f64);
                }
                Claim::EndOfStream | Claim::Shutdown => break WorkerExit::Drained,
                Claim::Cancelled => break WorkerExit::Cancelled,
            }
        };

        debug!(worker = self.index, written, ?exit, "worker exiting");
        exit
    }
}

/// Reports a worker's exit to the pool, panics included.
struct ExitNotice {
    index: usize,
    done: Sender<usize>,
    signal: Arc<FailureSignal>,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        if thread::panicking() {
            self.signal.fail(CaptureError::wait(
                format!("worker {}", self.index),
                "worker panicked",
            ));
        }
        let _ = self.done.send(self.index);
    }
}

/// Fixed set of worker threads, created once per session
pub(crate) struct WorkerPool {
    workers: Vec<Option<JoinHandle<WorkerExit>>>,
    finished: Receiver<usize>,
    written: Arc<AtomicU64>,
}

impl WorkerPool {
    /// Spawns `count` workers. If any spawn fails, the ones already running
    /// are cancelled and joined before the error is returned.
    pub fn spawn(
        count: usize,
        consumer: &FrameConsumer,
        sink: Arc<dyn FrameSink>,
        signal: Arc<FailureSignal>,
    ) -> Result<Self, CaptureError> {
        let (done, finished) = channel::unbounded();
        let written = Arc::new(AtomicU64::new(0));
        let mut pool = Self {
            workers: Vec::with_capacity(count),
            finished,
            written: Arc::clone(&written),
        };

        for index in 0..count {
            let worker = Worker {
                index,
                consumer: consumer.clone(),
                sink: Arc::clone(&sink),
                signal: Arc::clone(&signal),
                written: Arc::clone(&written),
            };
            let notice = ExitNotice {
                index,
                done: done.clone(),
                signal: Arc::clone(&signal),
            };

            let spawned = thread::Builder::new()
                .name(format!("frame-worker-{index}"))
                .spawn(move || {
                    let _notice = notice;
                    worker.run()
                });

            match spawned {
                Ok(handle) => pool.workers.push(Some(handle)),
                Err(source) => {
                    signal.fail(CaptureError::spawn(format!("worker thread {index}"), source));
                    drop(done);
                    if let Err(err) = pool.join_all() {
                        warn!("joining partial pool: {err}");
                    }
                    return Err(signal.aborted());
                }
            }
        }

        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn frames_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Joins workers in the order they finish.
    ///
    /// Returns the first join failure (a worker panic) after every worker
    /// has been joined.
    pub fn join_all(&mut self) -> Result<(), CaptureError> {
        let mut pending = self.workers.iter().filter(|w| w.is_some()).count();
        let mut first_err = None;

        while pending > 0 {
            let index = self
                .finished
                .recv()
                .map_err(|_| CaptureError::wait("worker pool", "completion channel closed"))?;
            let Some(handle) = self.workers.get_mut(index).and_then(Option::take) else {
                continue;
            };
            pending -= 1;

            match handle.join() {
                Ok(exit) => debug!(worker = index, ?exit, pending, "worker joined"),
                Err(_) => {
                    first_err.get_or_insert_with(|| {
                        CaptureError::wait(format!("worker {index}"), "worker panicked")
                    });
                }
            }
        }

        first_err.map_or(Ok(()), Err)
    }
}

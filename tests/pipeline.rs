//! Integration tests for the capture pipeline.
//!
//! Every blocking step runs under a deadline so a deadlock fails the test
//! instead of hanging the suite.

use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam::channel;
use framepipe::pipeline::{frame_queue, Claim};
use framepipe::{
    CaptureSession, ErrorKind, FailureSignal, FileOutputConfig, Frame, FrameId, FrameLayout,
    FrameSink, ImageFormat, OutputConfig, PixelFormat, SinkError, SinkOrdering,
};

const DEADLINE: Duration = Duration::from_secs(20);

/// Runs `f` on its own thread and fails if it does not return in time.
fn within<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    let (tx, rx) = channel::bounded(1);
    thread::spawn(move || {
        let _ = tx.send(f());
    });
    rx.recv_timeout(DEADLINE)
        .expect("did not complete before the deadline")
}

fn pipeline(capacity: usize, workers: usize) -> framepipe::PipelineConfig {
    framepipe::PipelineConfig {
        queue_capacity: capacity,
        workers,
    }
}

/// 8x2 rgb24, 48 bytes per frame.
fn small_layout() -> FrameLayout {
    FrameLayout::new(8, 2, PixelFormat::Rgb24)
}

/// Frame payload that identifies its frame: id in the first 8 bytes, then filler.
fn payload(id: u64, size: usize) -> Vec<u8> {
    let mut bytes = vec![(id % 251) as u8; size];
    bytes[..8].copy_from_slice(&id.to_le_bytes());
    bytes
}

/// Ordered sink that records the byte stream and optionally fails on one frame.
struct StreamRecorder {
    bytes: Mutex<Vec<u8>>,
    fail_on: Option<FrameId>,
    delay: Duration,
}

impl StreamRecorder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            bytes: Mutex::new(Vec::new()),
            fail_on: None,
            delay: Duration::ZERO,
        })
    }
}

impl FrameSink for StreamRecorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn ordering(&self) -> SinkOrdering {
        SinkOrdering::Ordered
    }

    fn write(&self, id: FrameId, payload: &[u8]) -> Result<(), SinkError> {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        if self.fail_on == Some(id) {
            return Err(SinkError::custom("broken pipe"));
        }
        self.bytes.lock().unwrap().extend_from_slice(payload);
        Ok(())
    }
}

/// Unordered sink that sleeps on every write.
struct SlowCounter {
    written: AtomicU64,
    delay: Duration,
}

impl FrameSink for SlowCounter {
    fn name(&self) -> &str {
        "slow"
    }

    fn ordering(&self) -> SinkOrdering {
        SinkOrdering::Unordered
    }

    fn write(&self, _id: FrameId, _payload: &[u8]) -> Result<(), SinkError> {
        thread::sleep(self.delay);
        self.written.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn test_stream_sink_receives_frames_in_order() {
    let layout = small_layout();
    let size = layout.frame_size();
    let sink = StreamRecorder::new();
    let shared: Arc<dyn FrameSink> = sink.clone();

    let stats = within(move || {
        let mut session = CaptureSession::start(&pipeline(8, 1), layout, shared).unwrap();
        for id in 0..1000 {
            session
                .enqueue(&Frame::new(FrameId(id), payload(id, size)))
                .unwrap();
        }
        session.finish().unwrap()
    });

    assert_eq!(stats.frames_written, 1000);
    let expected: Vec<u8> = (0..1000).flat_map(|id| payload(id, size)).collect();
    assert_eq!(*sink.bytes.lock().unwrap(), expected);
}

#[cfg(unix)]
#[test]
fn test_encoder_subprocess_receives_exact_stream() {
    use framepipe::sink::EncoderSink;
    use std::process::{Command, Stdio};

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("stream.raw");
    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg("cat > \"$0\"")
        .arg(&out)
        .stdin(Stdio::piped());

    let layout = small_layout();
    let size = layout.frame_size();
    let sink: Arc<dyn FrameSink> = Arc::new(EncoderSink::spawn_command("cat", command).unwrap());

    within(move || {
        let mut session = CaptureSession::start(&pipeline(8, 1), layout, sink).unwrap();
        for id in 0..1000 {
            session
                .enqueue(&Frame::new(FrameId(id), payload(id, size)))
                .unwrap();
        }
        session.finish().unwrap();
    });

    let written = fs::read(&out).unwrap();
    assert_eq!(written.len(), 1000 * size);
    for (id, frame) in written.chunks_exact(size).enumerate() {
        assert_eq!(frame, payload(id as u64, size).as_slice());
    }
}

#[cfg(unix)]
#[test]
fn test_encoder_nonzero_exit_fails_finish() {
    use framepipe::sink::EncoderSink;
    use std::process::{Command, Stdio};

    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg("cat > /dev/null; exit 1")
        .stdin(Stdio::piped());
    let sink: Arc<dyn FrameSink> = Arc::new(EncoderSink::spawn_command("sh", command).unwrap());
    let layout = small_layout();

    let err = within(move || {
        let mut session = CaptureSession::start(&pipeline(8, 1), layout, sink).unwrap();
        session
            .enqueue(&Frame::new(FrameId(0), payload(0, layout.frame_size())))
            .unwrap();
        session.finish().unwrap_err()
    });
    assert_eq!(err.kind(), ErrorKind::Finalize);
}

#[test]
fn test_file_sink_pool_writes_every_frame_once() {
    let dir = tempfile::tempdir().unwrap();
    let output = OutputConfig::Files(FileOutputConfig {
        dir: dir.path().to_path_buf(),
        format: ImageFormat::Raw,
        ..Default::default()
    });
    let layout = small_layout();
    let size = layout.frame_size();
    let sink = framepipe::sink::open(&output, layout).unwrap();

    let stats = within(move || {
        let mut session = CaptureSession::start(&pipeline(8, 8), layout, sink).unwrap();
        assert_eq!(session.protocol(), framepipe::ShutdownProtocol::Broadcast);
        for id in 0..64 {
            session
                .enqueue(&Frame::new(FrameId(id), payload(id, size)))
                .unwrap();
        }
        session.finish().unwrap()
    });
    assert_eq!(stats.frames_written, 64);
    assert_eq!(stats.workers, 8);

    let mut names: Vec<String> = fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    let expected: Vec<String> = (0..64).map(|id| format!("{id:06}.raw")).collect();
    assert_eq!(names, expected);

    for id in 0..64u64 {
        let bytes = fs::read(dir.path().join(format!("{id:06}.raw"))).unwrap();
        assert_eq!(bytes, payload(id, size));
    }
}

/// Unordered sink that checks every payload against its id and counts writes per id.
struct IdChecker {
    seen: Mutex<Vec<u32>>,
    mismatched: AtomicU64,
}

impl IdChecker {
    fn new(frames: usize) -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(vec![0; frames]),
            mismatched: AtomicU64::new(0),
        })
    }
}

impl FrameSink for IdChecker {
    fn name(&self) -> &str {
        "id-checker"
    }

    fn ordering(&self) -> SinkOrdering {
        SinkOrdering::Unordered
    }

    fn write(&self, id: FrameId, bytes: &[u8]) -> Result<(), SinkError> {
        if bytes != payload(id.0, bytes.len()).as_slice() {
            self.mismatched.fetch_add(1, Ordering::SeqCst);
        }
        self.seen.lock().unwrap()[id.0 as usize] += 1;
        Ok(())
    }
}

#[test]
fn test_more_workers_than_slots_write_each_frame_once() {
    const FRAMES: u64 = 2000;
    let layout = small_layout();
    let size = layout.frame_size();

    for _ in 0..20 {
        let sink = IdChecker::new(FRAMES as usize);
        let shared: Arc<dyn FrameSink> = sink.clone();

        let stats = within(move || {
            let mut session = CaptureSession::start(&pipeline(2, 8), layout, shared).unwrap();
            for id in 0..FRAMES {
                session
                    .enqueue(&Frame::new(FrameId(id), payload(id, size)))
                    .unwrap();
            }
            session.finish().unwrap()
        });

        assert_eq!(stats.frames_written, FRAMES);
        assert_eq!(sink.mismatched.load(Ordering::SeqCst), 0);
        let seen = sink.seen.lock().unwrap();
        let wrong: Vec<usize> = (0..seen.len()).filter(|&id| seen[id] != 1).collect();
        assert!(wrong.is_empty(), "frames not written exactly once: {wrong:?}");
    }
}

#[test]
fn test_sink_failure_reaches_producer() {
    let sink = Arc::new(StreamRecorder {
        bytes: Mutex::new(Vec::new()),
        fail_on: Some(FrameId(5)),
        delay: Duration::from_millis(1),
    });
    let shared: Arc<dyn FrameSink> = sink.clone();
    let layout = small_layout();

    let (failed_at, err) = within(move || {
        let mut session = CaptureSession::start(&pipeline(8, 1), layout, shared).unwrap();
        let mut pattern = framepipe::TestPattern::new(layout);
        for id in 0..100 {
            if let Err(err) = session.publish(FrameId(id), &mut pattern) {
                assert!(session.is_failed());
                return (id, session.abort(err));
            }
        }
        panic!("every publish succeeded after the sink failed");
    });

    assert_eq!(err.kind(), ErrorKind::Write);
    // The producer can run at most a queue's worth ahead of the failure.
    assert!(failed_at <= 5 + 8 + 1, "failure surfaced late, at frame {failed_at}");
    assert_eq!(sink.bytes.lock().unwrap().len(), 5 * layout.frame_size());
}

#[test]
fn test_broadcast_shutdown_drains_pending_frames() {
    let sink = Arc::new(SlowCounter {
        written: AtomicU64::new(0),
        delay: Duration::from_millis(2),
    });
    let shared: Arc<dyn FrameSink> = sink.clone();
    let layout = small_layout();

    within(move || {
        let mut session = CaptureSession::start(&pipeline(8, 4), layout, shared).unwrap();
        let mut pattern = framepipe::TestPattern::new(layout);
        for id in 0..50 {
            session.publish(FrameId(id), &mut pattern).unwrap();
        }
        session.finish().unwrap();
    });

    assert_eq!(sink.written.load(Ordering::SeqCst), 50);
}

#[test]
fn test_idle_pool_shuts_down() {
    let sink = Arc::new(SlowCounter {
        written: AtomicU64::new(0),
        delay: Duration::ZERO,
    });
    let shared: Arc<dyn FrameSink> = sink.clone();

    let stats = within(move || {
        CaptureSession::start(&pipeline(2, 8), small_layout(), shared)
            .unwrap()
            .finish()
            .unwrap()
    });
    assert_eq!(stats.frames_written, 0);
    assert_eq!(stats.workers, 8);
}

#[test]
fn test_full_queue_blocks_producer() {
    let signal = Arc::new(FailureSignal::new());
    let (mut producer, consumer) = frame_queue(2, 4, signal).unwrap();
    let (done_tx, done_rx) = channel::unbounded();

    let handle = thread::spawn(move || {
        for id in 0..3 {
            producer.enqueue(&Frame::new(FrameId(id), vec![0u8; 4])).unwrap();
            done_tx.send(id).unwrap();
        }
    });

    assert_eq!(done_rx.recv_timeout(DEADLINE).unwrap(), 0);
    assert_eq!(done_rx.recv_timeout(DEADLINE).unwrap(), 1);
    assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());

    match consumer.dequeue() {
        Claim::Frame(frame) => assert_eq!(frame.id(), FrameId(0)),
        _ => panic!("expected a frame"),
    }
    assert_eq!(done_rx.recv_timeout(DEADLINE).unwrap(), 2);
    handle.join().unwrap();
}

#[test]
fn test_occupancy_accounts_for_every_slot() {
    let signal = Arc::new(FailureSignal::new());
    let (mut producer, consumer) = frame_queue(4, 4, signal).unwrap();
    let monitor = producer.monitor();

    for id in 0..3 {
        producer.enqueue(&Frame::new(FrameId(id), vec![0u8; 4])).unwrap();
    }
    let occupancy = monitor.occupancy();
    assert_eq!((occupancy.free, occupancy.filled, occupancy.in_flight), (1, 3, 0));

    let Claim::Frame(frame) = consumer.dequeue() else {
        panic!("expected a frame");
    };
    let occupancy = monitor.occupancy();
    assert_eq!((occupancy.free, occupancy.filled, occupancy.in_flight), (1, 2, 1));
    assert_eq!(
        occupancy.free + occupancy.filled + occupancy.in_flight,
        occupancy.capacity
    );

    drop(frame);
    let occupancy = monitor.occupancy();
    assert_eq!((occupancy.free, occupancy.filled, occupancy.in_flight), (2, 2, 0));
}

//! Bounded frame ring buffer shared by the render loop and the sink workers.
//!
//! The queue is a fixed arena of `capacity` frame slots, allocated once, plus
//! two counting semaphores: `free` starts at `capacity` and gates the producer,
//! `filled` starts at zero and gates consumers. A slot's lifecycle is
//! free -> written by the producer -> filled -> claimed by one consumer -> free.
//!
//! There is exactly one [`FrameProducer`], which owns the write cursor. Any
//! number of [`FrameConsumer`] clones share the read cursor behind a mutex so
//! claiming a slot and advancing the cursor is one step. Each slot carries
//! its own lock: a producer that wraps around onto a slot still being
//! processed by a slow consumer waits for it rather than overwriting it.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use bytes::BytesMut;
use crossbeam::utils::CachePadded;
use tracing::{debug, trace};

use crate::capture::{Frame, FrameId, PixelSource};
use crate::error::{BoxError, CaptureError};
use crate::pipeline::semaphore::{Semaphore, Wait};
use crate::pipeline::signal::FailureSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    Empty,
    Frame(FrameId),
    EndOfStream,
}

struct Slot {
    entry: Entry,
    payload: BytesMut,
}

struct ReadState {
    cursor: usize,
    claimed: u64,
}

#[derive(Default)]
struct Stats {
    frames_enqueued: AtomicU64,
    frames_dequeued: AtomicU64,
    producer_stalls: AtomicU64,
}

struct Shared {
    slots: Box<[Mutex<Slot>]>,
    frame_size: usize,
    free: Semaphore,
    filled: Semaphore,
    reader: Mutex<ReadState>,
    /// Slots published so far, sentinels included.
    published: CachePadded<AtomicU64>,
    in_flight: AtomicUsize,
    terminating: AtomicBool,
    /// Termination wake-ups sitting in `filled` that carry no frame.
    surplus: AtomicUsize,
    signal: Arc<FailureSignal>,
    stats: CachePadded<Stats>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn release_free(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.free.release();
    }
}

/// Point-in-time view of the slot accounting.
///
/// `free + filled + in_flight == capacity` whenever no thread is between two
/// steps of a claim or release. Termination wake-ups are not frames and are
/// not counted in `filled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occupancy {
    pub capacity: usize,
    pub free: usize,
    pub filled: usize,
    pub in_flight: usize,
}

/// Counters for monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub frames_enqueued: u64,
    pub frames_dequeued: u64,
    pub producer_stalls: u64,
}

/// Creates a queue of `capacity` slots of `frame_size` bytes each.
///
/// Every blocking wait on the returned handles is cancelled by `signal`.
pub fn frame_queue(
    capacity: usize,
    frame_size: usize,
    signal: Arc<FailureSignal>,
) -> Result<(FrameProducer, FrameConsumer), CaptureError> {
    if capacity == 0 {
        return Err(CaptureError::Config("queue capacity must be positive".into()));
    }
    if frame_size == 0 {
        return Err(CaptureError::Config("frame size must be positive".into()));
    }

    let slots = (0..capacity)
        .map(|_| {
            Mutex::new(Slot {
                entry: Entry::Empty,
                payload: BytesMut::zeroed(frame_size),
            })
        })
        .collect();

    let shared = Arc::new(Shared {
        slots,
        frame_size,
        free: Semaphore::new(capacity),
        filled: Semaphore::new(0),
        reader: Mutex::new(ReadState {
            cursor: 0,
            claimed: 0,
        }),
        published: CachePadded::new(AtomicU64::new(0)),
        in_flight: AtomicUsize::new(0),
        terminating: AtomicBool::new(false),
        surplus: AtomicUsize::new(0),
        signal,
        stats: CachePadded::new(Stats::default()),
    });

    debug!(
        capacity,
        frame_size,
        total_mb = (capacity * frame_size) as f64 / (1024.0 * 1024.0),
        "frame queue allocated"
    );

    Ok((
        FrameProducer {
            shared: Arc::clone(&shared),
            write_cursor: 0,
            last_id: None,
        },
        FrameConsumer { shared },
    ))
}

/// Read-only queue handle for monitoring
#[derive(Clone)]
pub struct QueueMonitor {
    shared: Arc<Shared>,
}

impl QueueMonitor {
    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    pub fn occupancy(&self) -> Occupancy {
        Occupancy {
            capacity: self.shared.capacity(),
            free: self.shared.free.available(),
            filled: self
                .shared
                .filled
                .available()
                .saturating_sub(self.shared.surplus.load(Ordering::Acquire)),
            in_flight: self.shared.in_flight.load(Ordering::Acquire),
        }
    }

    pub fn stats(&self) -> QueueStats {
        let stats = &self.shared.stats;
        QueueStats {
            frames_enqueued: stats.frames_enqueued.load(Ordering::Relaxed),
            frames_dequeued: stats.frames_dequeued.load(Ordering::Relaxed),
            producer_stalls: stats.producer_stalls.load(Ordering::Relaxed),
        }
    }
}

/// The single writer. Not `Clone`: only one thread ever advances the write cursor.
pub struct FrameProducer {
    shared: Arc<Shared>,
    write_cursor: usize,
    last_id: Option<FrameId>,
}

impl FrameProducer {
    pub fn frame_size(&self) -> usize {
        self.shared.frame_size
    }

    pub fn monitor(&self) -> QueueMonitor {
        QueueMonitor {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Copies `frame` into the next free slot and publishes it.
    pub fn enqueue(&mut self, frame: &Frame) -> Result<(), CaptureError> {
        if frame.payload.len() != self.shared.frame_size {
            return Err(CaptureError::Usage(format!(
                "frame {} has {} bytes, expected {}",
                frame.id,
                frame.payload.len(),
                self.shared.frame_size
            )));
        }
        let payload = &frame.payload;
        self.publish(frame.id, &mut |_: FrameId, dst: &mut [u8]| -> Result<(), BoxError> {
            dst.copy_from_slice(payload);
            Ok(())
        })
    }

    /// Captures the next frame straight into a free slot and publishes it.
    ///
    /// Blocks while the queue is full. Returns [`CaptureError::Aborted`] as
    /// soon as the session fails, even if it was blocked. If `source` fails,
    /// the slot goes back to the free pool unpublished.
    pub fn publish<S>(&mut self, id: FrameId, source: &mut S) -> Result<(), CaptureError>
    where
        S: PixelSource + ?Sized,
    {
        if let Some(last) = self.last_id {
            if id <= last {
                return Err(CaptureError::Usage(format!(
                    "frame id {id} is not after previous frame {last}"
                )));
            }
        }

        let index = self.claim_free()?;
        {
            let mut slot = lock(&self.shared.slots[index]);
            if let Err(err) = source.read_pixels(id, &mut slot.payload) {
                drop(slot);
                self.shared.release_free();
                return Err(CaptureError::Source(err));
            }
            slot.entry = Entry::Frame(id);
        }
        self.last_id = Some(id);
        self.commit();
        trace!(%id, slot = index, "frame published");
        Ok(())
    }

    /// Publishes the end-of-stream sentinel through the normal path.
    pub fn enqueue_end_of_stream(&mut self) -> Result<(), CaptureError> {
        let index = self.claim_free()?;
        lock(&self.shared.slots[index]).entry = Entry::EndOfStream;
        self.commit();
        debug!(slot = index, "end of stream queued");
        Ok(())
    }

    fn claim_free(&mut self) -> Result<usize, CaptureError> {
        let shared = &self.shared;
        if !shared.free.try_acquire() {
            shared.stats.producer_stalls.fetch_add(1, Ordering::Relaxed);
            let stalled = Instant::now();
            if let Wait::Cancelled = shared.free.acquire(shared.signal.token()) {
                return Err(shared.signal.aborted());
            }
            metrics::histogram!("framepipe_producer_stall_us")
                .record(stalled.elapsed().as_micros() as f64);
        } else if shared.signal.is_failed() {
            shared.free.release();
            return Err(shared.signal.aborted());
        }
        shared.in_flight.fetch_add(1, Ordering::AcqRel);
        Ok(self.write_cursor)
    }

    fn commit(&mut self) {
        let shared = &self.shared;
        self.write_cursor = (self.write_cursor + 1) % shared.capacity();
        shared.published.fetch_add(1, Ordering::Release);
        shared.stats.frames_enqueued.fetch_add(1, Ordering::Relaxed);
        shared.in_flight.fetch_sub(1, Ordering::AcqRel);
        shared.filled.release();
    }
}

/// Result of a consumer's blocking dequeue
pub enum Claim<'a> {
    /// A real frame; the slot is released when the guard drops.
    Frame(ClaimedFrame<'a>),
    /// The sentinel was dequeued; its slot is already released.
    EndOfStream,
    /// The queue is drained and termination was broadcast.
    Shutdown,
    /// The session failed.
    Cancelled,
}

/// A frame owned by one consumer while it is processed
pub struct ClaimedFrame<'a> {
    id: FrameId,
    slot: MutexGuard<'a, Slot>,
    shared: &'a Shared,
}

impl ClaimedFrame<'_> {
    pub fn id(&self) -> FrameId {
        self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.slot.payload
    }
}

impl Drop for ClaimedFrame<'_> {
    fn drop(&mut self) {
        self.slot.entry = Entry::Empty;
        self.shared.release_free();
    }
}

/// Consumer handle; clone one per worker
#[derive(Clone)]
pub struct FrameConsumer {
    shared: Arc<Shared>,
}

impl FrameConsumer {
    pub fn monitor(&self) -> QueueMonitor {
        QueueMonitor {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Blocks until a filled slot can be claimed, termination is broadcast or
    /// the session fails.
    pub fn dequeue(&self) -> Claim<'_> {
        let shared = &*self.shared;
        if let Wait::Cancelled = shared.filled.acquire(shared.signal.token()) {
            return Claim::Cancelled;
        }

        let (index, mut slot) = {
            let mut reader = lock(&shared.reader);
            if reader.claimed == shared.published.load(Ordering::Acquire) {
                // Surplus permits only come from `begin_termination`. Pass
                // this one on so every peer still parked in `acquire` wakes.
                debug_assert!(shared.terminating.load(Ordering::Acquire));
                drop(reader);
                shared.filled.release();
                return Claim::Shutdown;
            }
            let index = reader.cursor;
            // Take the slot before the cursor moves on. Free permits are not
            // tied to slots, so once another consumer releases, the producer
            // may wrap onto this index and must find it held.
            let slot = lock(&shared.slots[index]);
            reader.cursor = (reader.cursor + 1) % shared.capacity();
            reader.claimed += 1;
            (index, slot)
        };
        shared.in_flight.fetch_add(1, Ordering::AcqRel);
        shared.stats.frames_dequeued.fetch_add(1, Ordering::Relaxed);

        match slot.entry {
            Entry::Frame(id) => Claim::Frame(ClaimedFrame { id, slot, shared }),
            Entry::EndOfStream => {
                slot.entry = Entry::Empty;
                drop(slot);
                shared.release_free();
                Claim::EndOfStream
            }
            Entry::Empty => {
                drop(slot);
                shared.release_free();
                shared.signal.fail(CaptureError::wait(
                    "frame queue",
                    format!("slot {index} claimed before it was written"),
                ));
                Claim::Cancelled
            }
        }
    }

    /// Broadcasts termination to a pool of `workers` consumers.
    ///
    /// Frames already published are still handed out; a consumer sees
    /// [`Claim::Shutdown`] only once nothing is left to claim. One wake-up
    /// per worker is injected and every exiting worker passes its wake-up
    /// on, so no worker is left parked however the wake-ups are distributed.
    pub fn begin_termination(&self, workers: usize) {
        let shared = &self.shared;
        if shared.terminating.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(workers, "broadcasting termination");
        shared.surplus.fetch_add(workers, Ordering::AcqRel);
        for _ in 0..workers {
            shared.filled.release();
        }
    }

    pub fn is_terminating(&self) -> bool {
        self.shared.terminating.load(Ordering::Acquire)
    }
}

//! Counting semaphore with a cancellable acquire.

use crossbeam::channel::{self, select, Receiver, Sender};

use crate::pipeline::signal::CancelToken;

/// Outcome of a cancellable wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait<T> {
    Ready(T),
    Cancelled,
}

/// Permits are unit tokens in an unbounded channel; the count is the channel
/// length. Holding both ends keeps the channel connected for the semaphore's
/// whole life, so `recv` only ever returns a permit.
pub(crate) struct Semaphore {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        let (tx, rx) = channel::unbounded();
        let semaphore = Self { tx, rx };
        for _ in 0..permits {
            semaphore.release();
        }
        semaphore
    }

    pub fn release(&self) {
        // Cannot fail: `self.rx` is alive.
        let _ = self.tx.send(());
    }

    /// Blocks until a permit is available or `cancel` fires.
    ///
    /// A cancelled token always wins over a permit, so a failed session is
    /// reported even when the wait could also have succeeded.
    pub fn acquire(&self, cancel: &CancelToken) -> Wait<()> {
        if cancel.is_cancelled() {
            return Wait::Cancelled;
        }
        select! {
            recv(self.rx) -> permit => match permit {
                Ok(()) if !cancel.is_cancelled() => Wait::Ready(()),
                Ok(()) => {
                    self.release();
                    Wait::Cancelled
                }
                Err(_) => Wait::Cancelled,
            },
            recv(cancel.watch()) -> _ => Wait::Cancelled,
        }
    }

    pub fn try_acquire(&self) -> bool {
        self.rx.try_recv().is_ok()
    }

    pub fn available(&self) -> usize {
        self.rx.len()
    }
}

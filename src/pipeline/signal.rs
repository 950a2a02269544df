//! Cancellation and fail-fast signalling shared by every blocking wait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crossbeam::channel::{self, Receiver, Sender};
use once_cell::sync::OnceCell;
use tracing::error;

use crate::error::CaptureError;

/// Never sent; the channel only exists to be disconnected.
pub(crate) enum Never {}

struct TokenInner {
    trigger: Mutex<Option<Sender<Never>>>,
    cancelled: AtomicBool,
    watch: Receiver<Never>,
}

/// Broadcast cancellation observable by any number of blocked waits.
///
/// Cancelling drops the only sender, which disconnects `watch` and wakes
/// every `select!` parked on it at once. Cancellation is terminal.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = channel::bounded(0);
        Self {
            inner: Arc::new(TokenInner {
                trigger: Mutex::new(Some(tx)),
                cancelled: AtomicBool::new(false),
                watch: rx,
            }),
        }
    }

    /// Returns `true` for the call that actually cancelled.
    pub fn cancel(&self) -> bool {
        let trigger = self
            .inner
            .trigger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.inner.cancelled.store(true, Ordering::Release);
        trigger.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn watch(&self) -> &Receiver<Never> {
        &self.inner.watch
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Session-wide fail-fast channel.
///
/// The first recorded failure wins; later ones are logged and dropped. Recording
/// a failure cancels the token so a producer stuck on a full queue and workers
/// stuck on an empty one all wake within one wait.
#[derive(Default)]
pub struct FailureSignal {
    cause: OnceCell<Arc<CaptureError>>,
    token: CancelToken,
}

impl FailureSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `err` as the session's failure. Returns `false` if another
    /// failure was already recorded.
    pub fn fail(&self, err: CaptureError) -> bool {
        let won = self.cause.set(Arc::new(err)).is_ok();
        if won {
            if let Some(cause) = self.cause.get() {
                error!(kind = ?cause.kind(), "capture failed: {cause}");
            }
        }
        // Cause is stored before waking waiters so they never see a bare cancel.
        self.token.cancel();
        won
    }

    pub fn is_failed(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cause(&self) -> Option<Arc<CaptureError>> {
        self.cause.get().cloned()
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Error handed to threads that observe the failure second-hand.
    pub(crate) fn aborted(&self) -> CaptureError {
        match self.cause() {
            Some(cause) => CaptureError::Aborted(cause),
            None => CaptureError::Interrupted,
        }
    }
}

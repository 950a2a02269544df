//! Error types for the capture pipeline.
//!
//! Everything in here is fatal for the session. A consumer thread that hits a
//! [`CaptureError`] records it in the [`FailureSignal`](crate::pipeline::FailureSignal)
//! and every other thread observes [`CaptureError::Aborted`] wrapping that first cause.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;

use crate::capture::FrameId;

/// Boxed error returned by pixel sources.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Stage that failed, independent of the concrete error payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A worker thread or subprocess could not be created.
    Spawn,
    /// A sink rejected or partially failed a write.
    Write,
    /// A synchronization wait or join failed.
    Wait,
    /// The sink could not be finalized (encoder exited non-zero, etc).
    Finalize,
    /// Invalid or unreadable configuration.
    Config,
    /// The pixel source failed to produce a frame.
    Source,
    /// The API was driven incorrectly (wrong payload size, id order).
    Usage,
    /// The session was dropped before it was finished.
    Interrupted,
}

/// Fatal errors raised by a capture session.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("failed to spawn {what}: {source}")]
    Spawn {
        what: String,
        #[source]
        source: std::io::Error,
    },

    #[error("sink '{sink}' failed to write frame {frame}")]
    Write {
        sink: String,
        frame: FrameId,
        #[source]
        source: SinkError,
    },

    #[error("failed to write audio to {}", .path.display())]
    Audio {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("wait on {what} failed: {reason}")]
    Wait { what: String, reason: String },

    #[error("failed to finalize {what}")]
    Finalize {
        what: String,
        #[source]
        source: SinkError,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to load configuration")]
    Load(#[from] config::ConfigError),

    #[error("pixel source failed")]
    Source(#[source] BoxError),

    #[error("{0}")]
    Usage(String),

    #[error("capture aborted")]
    Aborted(#[source] Arc<CaptureError>),

    #[error("capture session dropped before finish")]
    Interrupted,
}

impl CaptureError {
    /// Returns the failing stage. [`CaptureError::Aborted`] reports its cause.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Spawn { .. } => ErrorKind::Spawn,
            Self::Write { .. } | Self::Audio { .. } => ErrorKind::Write,
            Self::Wait { .. } => ErrorKind::Wait,
            Self::Finalize { .. } => ErrorKind::Finalize,
            Self::Config(_) | Self::Load(_) => ErrorKind::Config,
            Self::Source(_) => ErrorKind::Source,
            Self::Usage(_) => ErrorKind::Usage,
            Self::Aborted(cause) => cause.kind(),
            Self::Interrupted => ErrorKind::Interrupted,
        }
    }

    pub(crate) fn spawn(what: impl Into<String>, source: std::io::Error) -> Self {
        Self::Spawn {
            what: what.into(),
            source,
        }
    }

    pub(crate) fn wait(what: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Wait {
            what: what.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised inside a [`FrameSink`](crate::sink::FrameSink) implementation.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// I/O failure, optionally tied to an artifact path.
    #[error("i/o error{}: {source}", on_path(.path))]
    Io {
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },

    /// Image encoding failed.
    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),

    /// The sink was already finished.
    #[error("sink already closed")]
    Closed,

    /// The downstream process reported failure.
    #[error("process exited with {0}")]
    ExitStatus(ExitStatus),

    /// Custom error for user-implemented sinks.
    #[error("{0}")]
    Custom(String),
}

impl SinkError {
    /// Creates a custom sink error with the given message.
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }

    /// I/O error not tied to a path (pipes, process handles).
    pub fn io(source: std::io::Error) -> Self {
        Self::Io { path: None, source }
    }

    /// I/O error on the given artifact.
    pub fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: Some(path.into()),
            source,
        }
    }
}

fn on_path(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| format!(" on {}", p.display()))
        .unwrap_or_default()
}

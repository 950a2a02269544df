//! Destinations for captured frames.
//!
//! A [`FrameSink`] persists frame payloads. Two sinks ship with the crate:
//!
//! - [`EncoderSink`]: streams raw frames, in order, into an encoder subprocess
//! - [`FileSink`]: writes one image file per frame
//!
//! Sinks are called from worker threads, so every method takes `&self`;
//! use interior mutability where a sink needs state.

mod command;
mod encoder;
mod file;

pub use command::EncoderCommand;
pub use encoder::EncoderSink;
pub use file::{FileSink, ImageFormat};

use std::sync::Arc;

use crate::capture::{FrameId, FrameLayout};
use crate::error::{CaptureError, SinkError};
use crate::OutputConfig;

/// Ordering a sink needs from the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkOrdering {
    /// Bytes must arrive in publish order: one worker, end-of-stream sentinel.
    Ordered,
    /// Frames are independent: any number of workers, broadcast termination.
    Unordered,
}

/// A destination for frame payloads.
///
/// `write` does its own retrying (partial writes, short reads) and only
/// returns an error when the frame cannot be persisted. Any error aborts the
/// whole capture session.
pub trait FrameSink: Send + Sync {
    /// Human-readable name for logging and error messages.
    fn name(&self) -> &str;

    fn ordering(&self) -> SinkOrdering;

    /// Persists one frame. `payload` is exactly one frame in the session layout.
    fn write(&self, id: FrameId, payload: &[u8]) -> Result<(), SinkError>;

    /// Called once after every worker has exited.
    ///
    /// Default implementation does nothing.
    fn finish(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Opens the sink described by `output` for frames in `layout`.
pub fn open(output: &OutputConfig, layout: FrameLayout) -> Result<Arc<dyn FrameSink>, CaptureError> {
    match output {
        OutputConfig::Encoder(encoder) => {
            let command = EncoderCommand::from_config(encoder, layout);
            Ok(Arc::new(EncoderSink::spawn(&command)?))
        }
        OutputConfig::Files(files) => {
            let sink = FileSink::create(files, layout).map_err(|err| {
                CaptureError::Config(format!(
                    "cannot prepare output directory {}: {err}",
                    files.dir.display()
                ))
            })?;
            Ok(Arc::new(sink))
        }
    }
}

//! Ordered byte stream into an encoder subprocess.

use std::io::Write;
use std::process::{Child, ChildStdin, Command};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, info, warn};

use super::{EncoderCommand, FrameSink, SinkOrdering};
use crate::capture::FrameId;
use crate::error::{CaptureError, SinkError};

/// Streams every frame, in publish order and without framing, into the
/// stdin of an external encoder process.
///
/// The frame boundary is implicit in the constant frame size. [`finish`]
/// closes stdin and waits for the process; a non-zero exit is an error.
///
/// [`finish`]: FrameSink::finish
pub struct EncoderSink {
    name: String,
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Child>,
}

impl EncoderSink {
    /// Spawns the encoder with its stdin wired to this sink.
    pub fn spawn(command: &EncoderCommand) -> Result<Self, CaptureError> {
        info!(
            program = command.program(),
            args = ?command.build(),
            "starting encoder"
        );
        Self::spawn_command(command.program(), command.to_command())
    }

    /// Spawns an arbitrary command. Its stdin must be piped.
    pub fn spawn_command(name: impl Into<String>, mut command: Command) -> Result<Self, CaptureError> {
        let name = name.into();
        let mut child = command
            .spawn()
            .map_err(|source| CaptureError::spawn(format!("encoder '{name}'"), source))?;

        let Some(stdin) = child.stdin.take() else {
            // Reap it so it does not linger as a zombie.
            let _ = child.kill();
            let _ = child.wait();
            return Err(CaptureError::spawn(
                format!("encoder '{name}'"),
                std::io::Error::other("stdin is not piped"),
            ));
        };

        debug!(pid = child.id(), "encoder running");
        Ok(Self {
            name,
            stdin: Mutex::new(Some(stdin)),
            child: Mutex::new(child),
        })
    }
}

impl FrameSink for EncoderSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn ordering(&self) -> SinkOrdering {
        SinkOrdering::Ordered
    }

    fn write(&self, _id: FrameId, payload: &[u8]) -> Result<(), SinkError> {
        let mut stdin = self.stdin.lock().unwrap_or_else(PoisonError::into_inner);
        let pipe = stdin.as_mut().ok_or(SinkError::Closed)?;
        // write_all retries short writes until every byte is in the pipe
        pipe.write_all(payload).map_err(SinkError::io)
    }

    fn finish(&self) -> Result<(), SinkError> {
        // Dropping stdin is the encoder's end-of-input.
        drop(self.stdin.lock().unwrap_or_else(PoisonError::into_inner).take());

        let status = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .wait()
            .map_err(SinkError::io)?;

        if status.success() {
            info!(encoder = %self.name, "encoder finished");
            Ok(())
        } else {
            warn!(encoder = %self.name, %status, "encoder failed");
            Err(SinkError::ExitStatus(status))
        }
    }
}

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Producer-assigned frame number, strictly increasing within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FrameId(pub u64);

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Owned frame with immutable payload, for the copy path into the queue
#[derive(Debug, Clone)]
pub struct Frame {
    pub id: FrameId,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(id: FrameId, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }
}

/// Pixel formats we support, always tightly packed 8-bit channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    #[default]
    Rgb24,
    Rgba32,
}

impl PixelFormat {
    pub fn channels(self) -> usize {
        match self {
            Self::Rgb24 => 3,
            Self::Rgba32 => 4,
        }
    }

    /// Name of the format on an ffmpeg rawvideo input
    pub fn ffmpeg_name(self) -> &'static str {
        match self {
            Self::Rgb24 => "rgb24",
            Self::Rgba32 => "rgba",
        }
    }
}

/// Row order of the buffers produced by the pixel source.
///
/// GL readback yields the bottom row first, so sinks that expect top-down
/// images flip on output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowOrder {
    #[default]
    BottomUp,
    TopDown,
}

/// Frame geometry, fixed for the whole session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameLayout {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub row_order: RowOrder,
}

impl FrameLayout {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            row_order: RowOrder::default(),
        }
    }

    pub fn stride(&self) -> usize {
        self.width as usize * self.format.channels()
    }

    /// Payload size of every frame: width * height * channels, no padding
    pub fn frame_size(&self) -> usize {
        self.stride() * self.height as usize
    }
}

impl Default for FrameLayout {
    fn default() -> Self {
        Self::new(1920, 1080, PixelFormat::Rgb24)
    }
}

//! One image file per frame.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use super::{FrameSink, SinkOrdering};
use crate::capture::{FrameId, FrameLayout, PixelFormat, RowOrder};
use crate::error::SinkError;
use crate::utils::frame_file_name;
use crate::FileOutputConfig;

/// On-disk format of each frame artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormat {
    #[default]
    Png,
    Jpeg,
    /// Payload bytes exactly as captured, no header
    Raw,
}

impl ImageFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::Raw => "raw",
        }
    }
}

/// Writes each frame to `<dir>/<prefix><zero-padded id>.<ext>`.
///
/// Frames are independent, so any number of workers may write concurrently.
/// The padding keeps lexical and numeric order identical.
pub struct FileSink {
    dir: PathBuf,
    prefix: String,
    digits: usize,
    format: ImageFormat,
    layout: FrameLayout,
}

impl FileSink {
    /// Creates the output directory if needed.
    #[instrument(skip_all, fields(dir = %config.dir.display()))]
    pub fn create(config: &FileOutputConfig, layout: FrameLayout) -> Result<Self, SinkError> {
        fs::create_dir_all(&config.dir).map_err(|e| SinkError::file(&config.dir, e))?;
        info!(format = ?config.format, digits = config.digits, "writing frames to directory");

        Ok(Self {
            dir: config.dir.clone(),
            prefix: config.prefix.clone(),
            digits: config.digits,
            format: config.format,
            layout,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the artifact for `id`.
    pub fn path_for(&self, id: FrameId) -> PathBuf {
        self.dir.join(frame_file_name(
            &self.prefix,
            id,
            self.digits,
            self.format.extension(),
        ))
    }

    fn encode_image(&self, path: &Path, payload: &[u8]) -> Result<(), SinkError> {
        let color = match self.layout.format {
            PixelFormat::Rgb24 => image::ColorType::Rgb8,
            PixelFormat::Rgba32 => image::ColorType::Rgba8,
        };
        let format = match self.format {
            ImageFormat::Jpeg => image::ImageFormat::Jpeg,
            _ => image::ImageFormat::Png,
        };

        let flipped;
        let pixels = if self.layout.row_order == RowOrder::BottomUp {
            flipped = flip_rows(payload, self.layout.stride());
            &flipped[..]
        } else {
            payload
        };

        image::save_buffer_with_format(
            path,
            pixels,
            self.layout.width,
            self.layout.height,
            color,
            format,
        )?;
        Ok(())
    }
}

/// Reverses row order; sources hand us the bottom row first.
fn flip_rows(payload: &[u8], stride: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len());
    for row in payload.chunks_exact(stride).rev() {
        out.extend_from_slice(row);
    }
    out
}

impl FrameSink for FileSink {
    fn name(&self) -> &str {
        "files"
    }

    fn ordering(&self) -> SinkOrdering {
        SinkOrdering::Unordered
    }

    fn write(&self, id: FrameId, payload: &[u8]) -> Result<(), SinkError> {
        let path = self.path_for(id);
        match self.format {
            ImageFormat::Raw => fs::write(&path, payload).map_err(|e| SinkError::file(&path, e)),
            ImageFormat::Png | ImageFormat::Jpeg => self.encode_image(&path, payload),
        }
    }
}

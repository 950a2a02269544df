pub mod audio;
pub mod capture;
pub mod error;
pub mod pipeline;
pub mod session;
pub mod sink;
pub mod utils;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use capture::{Frame, FrameId, FrameLayout, PixelFormat, PixelSource, RowOrder, TestPattern};
pub use error::{BoxError, CaptureError, ErrorKind, SinkError};
pub use pipeline::{FailureSignal, Occupancy, ShutdownProtocol};
pub use session::{CaptureSession, SessionStats};
pub use sink::{FrameSink, ImageFormat, SinkOrdering};

/// Environment variables override file settings, e.g. `FRAMEPIPE__PIPELINE__WORKERS=4`
pub const ENV_PREFIX: &str = "FRAMEPIPE";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub frame: FrameLayout,
    pub pipeline: PipelineConfig,
    pub output: OutputConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Frame slots in the ring buffer
    pub queue_capacity: usize,
    /// Sink workers; ordered sinks always run exactly one
    pub workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 8,
            workers: 8,
        }
    }
}

impl PipelineConfig {
    /// Worker count actually used for a sink with `ordering`.
    pub fn effective_workers(&self, ordering: SinkOrdering) -> usize {
        match ordering {
            SinkOrdering::Ordered => {
                if self.workers != 1 {
                    warn!(
                        configured = self.workers,
                        "ordered sink needs a single worker, using 1"
                    );
                }
                1
            }
            SinkOrdering::Unordered => self.workers,
        }
    }
}

/// Where frames go
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputConfig {
    Encoder(EncoderConfig),
    Files(FileOutputConfig),
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self::Encoder(EncoderConfig::default())
    }
}

impl OutputConfig {
    pub fn ordering(&self) -> SinkOrdering {
        match self {
            Self::Encoder(_) => SinkOrdering::Ordered,
            Self::Files(_) => SinkOrdering::Unordered,
        }
    }
}

/// External video encoder reading raw frames on stdin
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub program: String,
    pub output: PathBuf,
    pub framerate: u32,
    pub codec: String,
    pub preset: String,
    pub crf: u32,
    pub output_pix_fmt: String,
    /// Pre-encoded audio track to mux in
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<PathBuf>,
    pub audio_codec: String,
    pub audio_bitrate: String,
    pub extra_args: Vec<String>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            output: PathBuf::from("capture.mp4"),
            framerate: 60,
            codec: "libx264".to_string(),
            preset: "ultrafast".to_string(),
            crf: 18,
            output_pix_fmt: "yuv420p".to_string(),
            audio: None,
            audio_codec: "aac".to_string(),
            audio_bitrate: "192k".to_string(),
            extra_args: Vec::new(),
        }
    }
}

/// One image per frame in a directory
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileOutputConfig {
    pub dir: PathBuf,
    pub prefix: String,
    /// Zero padding of the frame number
    pub digits: usize,
    pub format: ImageFormat,
}

impl Default for FileOutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("frames"),
            prefix: String::new(),
            digits: 6,
            format: ImageFormat::Png,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub raw_path: PathBuf,
    pub sample_rate: u32,
    pub channels: u16,
    /// Skip to keep the raw s16le dump
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoder: Option<AudioEncoderConfig>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            raw_path: PathBuf::from("audio.raw"),
            sample_rate: 44_100,
            channels: 2,
            encoder: Some(AudioEncoderConfig::default()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioEncoderConfig {
    pub program: String,
    pub output: PathBuf,
    /// LAME VBR quality, 0 (best) to 9
    pub quality: u8,
}

impl Default for AudioEncoderConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            output: PathBuf::from("audio.mp3"),
            quality: 2,
        }
    }
}

impl Config {
    /// Layers defaults, then the optional TOML file at `path`, then
    /// `FRAMEPIPE__*` environment variables, and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self, CaptureError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            debug!(path = %path.display(), "loading configuration file");
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CaptureError> {
        let invalid = |msg: &str| Err(CaptureError::Config(msg.to_string()));

        if self.frame.width == 0 || self.frame.height == 0 {
            return invalid("frame width and height must be positive");
        }
        if self.pipeline.queue_capacity == 0 {
            return invalid("pipeline.queue_capacity must be positive");
        }
        if self.pipeline.workers == 0 {
            return invalid("pipeline.workers must be positive");
        }
        match &self.output {
            OutputConfig::Encoder(encoder) => {
                if encoder.program.is_empty() {
                    return invalid("output.program must not be empty");
                }
                if encoder.framerate == 0 {
                    return invalid("output.framerate must be positive");
                }
            }
            OutputConfig::Files(files) => {
                if files.digits == 0 {
                    return invalid("output.digits must be positive");
                }
            }
        }
        if let Some(audio) = &self.audio {
            if audio.sample_rate == 0 || audio.channels == 0 {
                return invalid("audio sample_rate and channels must be positive");
            }
        }
        Ok(())
    }
}

//! framepipe: render a synthetic test pattern through a capture session

use std::f32::consts::TAU;
use std::path::PathBuf;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use framepipe::capture::TestPattern;
use framepipe::{
    audio, sink, utils, AudioConfig, CaptureSession, Config, FileOutputConfig, FrameId,
    OutputConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// TOML configuration file.
    #[arg(long, env = "FRAMEPIPE_CONFIG")]
    config: Option<PathBuf>,
    /// Number of frames to render.
    #[arg(long, default_value_t = 300)]
    frames: u64,
    /// Sink worker count (file output only).
    #[arg(long)]
    workers: Option<usize>,
    /// Write one image per frame into this directory instead of encoding.
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("framepipe=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let args = Args::parse();
    info!("framepipe launching...");

    let mut config = Config::load(args.config.as_deref())?;
    apply_overrides(&mut config, &args);
    config.validate()?;

    if let OutputConfig::Encoder(encoder) = &config.output {
        if utils::auto_detect_encoder(&encoder.program).is_none() {
            return Err(eyre!("encoder '{}' not found on PATH", encoder.program));
        }
    }

    if let Some(audio_config) = &config.audio {
        let fps = match &config.output {
            OutputConfig::Encoder(encoder) => encoder.framerate,
            OutputConfig::Files(_) => 60,
        };
        let samples = synthetic_tone(audio_config, args.frames, fps);
        let track = audio::save_audio(&samples, audio_config)?;
        if let OutputConfig::Encoder(encoder) = &mut config.output {
            encoder.audio.get_or_insert(track);
        }
    }

    let sink = sink::open(&config.output, config.frame)?;
    let mut session = CaptureSession::start(&config.pipeline, config.frame, sink)?;
    let mut pattern = TestPattern::new(config.frame);

    for id in 0..args.frames {
        if let Err(err) = session.publish(FrameId(id), &mut pattern) {
            return Err(session.abort(err).into());
        }
    }

    let stats = session.finish()?;
    info!(
        frames = stats.frames_written,
        stalls = stats.producer_stalls,
        workers = stats.workers,
        "done in {:.2}s",
        stats.elapsed.as_secs_f64()
    );
    Ok(())
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(workers) = args.workers {
        config.pipeline.workers = workers;
    }
    if let Some(dir) = &args.output_dir {
        match &mut config.output {
            OutputConfig::Files(files) => files.dir = dir.clone(),
            OutputConfig::Encoder(_) => {
                warn!("--output-dir given, writing image files instead of encoding");
                config.output = OutputConfig::Files(FileOutputConfig {
                    dir: dir.clone(),
                    ..Default::default()
                });
            }
        }
    }
}

/// 440 Hz sine covering the rendered frames, interleaved across channels
fn synthetic_tone(config: &AudioConfig, frames: u64, fps: u32) -> Vec<i16> {
    let per_channel = (frames * config.sample_rate as u64 / fps.max(1) as u64) as usize;
    let channels = config.channels as usize;

    let mut samples = Vec::with_capacity(per_channel * channels);
    for n in 0..per_channel {
        let t = n as f32 / config.sample_rate as f32;
        let value = ((TAU * 440.0 * t).sin() * i16::MAX as f32 * 0.25) as i16;
        samples.extend(std::iter::repeat(value).take(channels));
    }
    samples
}

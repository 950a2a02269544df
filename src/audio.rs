//! Audio side-channel: one whole-buffer PCM dump, optionally encoded.
//!
//! Unlike video this is not streamed. The full sample buffer is written once
//! at the end of a capture and, if an encoder is configured, converted to a
//! compressed file that the video encoder can mux.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use bytes::{BufMut, BytesMut};
use tracing::{info, instrument, warn};

use crate::error::{CaptureError, SinkError};
use crate::AudioConfig;

/// Writes interleaved s16 samples and runs the configured encoder.
///
/// Returns the path of the final artifact: the encoded file when an encoder
/// is configured, the raw PCM file otherwise. The raw file is removed after
/// encoding whether or not the encoder succeeded.
#[instrument(skip_all, fields(samples = samples.len()))]
pub fn save_audio(samples: &[i16], config: &AudioConfig) -> Result<PathBuf, CaptureError> {
    write_raw(samples, &config.raw_path)?;

    let Some(encoder) = &config.encoder else {
        info!(path = %config.raw_path.display(), "raw audio saved");
        return Ok(config.raw_path.clone());
    };

    let mut command = Command::new(&encoder.program);
    command
        .args(["-y", "-f", "s16le"])
        .arg("-ar")
        .arg(config.sample_rate.to_string())
        .arg("-ac")
        .arg(config.channels.to_string())
        .arg("-i")
        .arg(&config.raw_path)
        .args(["-c:a", "libmp3lame", "-q:a"])
        .arg(encoder.quality.to_string())
        .arg(&encoder.output)
        .stdin(Stdio::null());

    let status = command.status();
    remove_raw(&config.raw_path);

    let status = status
        .map_err(|source| CaptureError::spawn(format!("audio encoder '{}'", encoder.program), source))?;
    if !status.success() {
        return Err(CaptureError::Finalize {
            what: format!("audio encoder '{}'", encoder.program),
            source: SinkError::ExitStatus(status),
        });
    }

    info!(path = %encoder.output.display(), "audio encoded");
    Ok(encoder.output.clone())
}

fn write_raw(samples: &[i16], path: &Path) -> Result<(), CaptureError> {
    let mut buf = BytesMut::with_capacity(samples.len() * 2);
    for &sample in samples {
        buf.put_i16_le(sample);
    }

    fs::write(path, &buf).map_err(|source| {
        remove_raw(path);
        CaptureError::Audio {
            path: path.to_path_buf(),
            source,
        }
    })
}

fn remove_raw(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), "failed to remove raw audio: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::AudioEncoderConfig;
    use tempfile::tempdir;

    fn config(dir: &Path, encoder: Option<AudioEncoderConfig>) -> AudioConfig {
        AudioConfig {
            raw_path: dir.join("audio.raw"),
            encoder,
            ..Default::default()
        }
    }

    #[test]
    fn test_raw_is_little_endian() {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), None);

        let path = save_audio(&[1, -1, 0x0102], &config).unwrap();
        assert_eq!(path, config.raw_path);
        assert_eq!(fs::read(&path).unwrap(), vec![0x01, 0x00, 0xff, 0xff, 0x02, 0x01]);
    }

    #[test]
    fn test_unwritable_raw_path() {
        let dir = tempdir().unwrap();
        let config = AudioConfig {
            raw_path: dir.path().join("missing/audio.raw"),
            ..Default::default()
        };

        let err = save_audio(&[0; 8], &config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Write);
    }

    #[test]
    fn test_missing_encoder_is_spawn_error() {
        let dir = tempdir().unwrap();
        let config = config(
            dir.path(),
            Some(AudioEncoderConfig {
                program: "/nonexistent/framepipe-ffmpeg".into(),
                ..Default::default()
            }),
        );

        let err = save_audio(&[0; 8], &config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Spawn);
        assert!(!config.raw_path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_encoder_exit_status() {
        let dir = tempdir().unwrap();
        let ok = config(
            dir.path(),
            Some(AudioEncoderConfig {
                program: "true".into(),
                output: dir.path().join("audio.mp3"),
                ..Default::default()
            }),
        );
        assert_eq!(save_audio(&[0; 8], &ok).unwrap(), dir.path().join("audio.mp3"));
        assert!(!ok.raw_path.exists());

        let failing = config(
            dir.path(),
            Some(AudioEncoderConfig {
                program: "false".into(),
                ..Default::default()
            }),
        );
        let err = save_audio(&[0; 8], &failing).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Finalize);
        assert!(!failing.raw_path.exists());
    }
}

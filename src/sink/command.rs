use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use crate::capture::{FrameLayout, PixelFormat, RowOrder};
use crate::EncoderConfig;

/// Builds the encoder invocation that reads raw frames from stdin.
#[derive(Debug, Clone)]
pub struct EncoderCommand {
    program: String,
    width: u32,
    height: u32,
    input_format: PixelFormat,
    framerate: u32,
    vflip: bool,
    video_codec: String,
    preset: String,
    crf: u32,
    output_pix_fmt: String,
    audio: Option<PathBuf>,
    audio_codec: String,
    audio_bitrate: String,
    extra_args: Vec<String>,
    output_path: PathBuf,
}

impl EncoderCommand {
    pub fn new(output_path: impl Into<PathBuf>, layout: FrameLayout) -> Self {
        Self {
            program: "ffmpeg".to_string(),
            width: layout.width,
            height: layout.height,
            input_format: layout.format,
            framerate: 60,
            vflip: layout.row_order == RowOrder::BottomUp,
            video_codec: "libx264".to_string(),
            preset: "ultrafast".to_string(),
            crf: 18,
            output_pix_fmt: "yuv420p".to_string(),
            audio: None,
            audio_codec: "aac".to_string(),
            audio_bitrate: "192k".to_string(),
            extra_args: Vec::new(),
            output_path: output_path.into(),
        }
    }

    pub fn from_config(config: &EncoderConfig, layout: FrameLayout) -> Self {
        Self::new(&config.output, layout)
            .with_program(config.program.clone())
            .with_framerate(config.framerate)
            .with_video_codec(config.codec.clone())
            .with_preset(config.preset.clone())
            .with_crf(config.crf)
            .with_output_pix_fmt(config.output_pix_fmt.clone())
            .with_audio(config.audio.clone())
            .with_audio_codec(config.audio_codec.clone(), config.audio_bitrate.clone())
            .with_extra_args(config.extra_args.clone())
    }

    pub fn with_program(mut self, program: String) -> Self {
        self.program = program;
        self
    }

    pub fn with_framerate(mut self, framerate: u32) -> Self {
        self.framerate = framerate;
        self
    }

    pub fn with_vflip(mut self, vflip: bool) -> Self {
        self.vflip = vflip;
        self
    }

    pub fn with_video_codec(mut self, codec: String) -> Self {
        self.video_codec = codec;
        self
    }

    pub fn with_preset(mut self, preset: String) -> Self {
        self.preset = preset;
        self
    }

    pub fn with_crf(mut self, crf: u32) -> Self {
        self.crf = crf;
        self
    }

    pub fn with_output_pix_fmt(mut self, pix_fmt: String) -> Self {
        self.output_pix_fmt = pix_fmt;
        self
    }

    /// Muxes a pre-encoded audio track; the shorter stream ends the output.
    pub fn with_audio(mut self, audio: Option<PathBuf>) -> Self {
        self.audio = audio;
        self
    }

    pub fn with_audio_codec(mut self, codec: String, bitrate: String) -> Self {
        self.audio_codec = codec;
        self.audio_bitrate = bitrate;
        self
    }

    /// Inserted right before the output path.
    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    #[rustfmt::skip]
    pub fn build(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-y".into(),
            "-f".into(), "rawvideo".into(),
            "-pix_fmt".into(), self.input_format.ffmpeg_name().into(),
            "-s".into(), format!("{}x{}", self.width, self.height).into(),
            "-r".into(), self.framerate.to_string().into(),
            "-i".into(), "-".into(),
        ];

        if let Some(audio) = &self.audio {
            let inputs: [OsString; 6] = [
                "-i".into(), audio.clone().into_os_string(),
                "-map".into(), "0:v:0".into(),
                "-map".into(), "1:a:0".into(),
            ];
            args.extend(inputs);
        }

        if self.vflip {
            let filter: [OsString; 2] = ["-vf".into(), "vflip".into()];
            args.extend(filter);
        }

        let video: [OsString; 8] = [
            "-c:v".into(), self.video_codec.clone().into(),
            "-preset".into(), self.preset.clone().into(),
            "-crf".into(), self.crf.to_string().into(),
            "-pix_fmt".into(), self.output_pix_fmt.clone().into(),
        ];
        args.extend(video);

        if self.audio.is_some() {
            let audio: [OsString; 5] = [
                "-c:a".into(), self.audio_codec.clone().into(),
                "-b:a".into(), self.audio_bitrate.clone().into(),
                "-shortest".into(),
            ];
            args.extend(audio);
        }

        args.extend(self.extra_args.iter().map(OsString::from));
        args.push(self.output_path.clone().into_os_string());
        args
    }

    /// Process with stdin piped and output inherited
    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(self.build())
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        command
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> FrameLayout {
        FrameLayout::new(640, 360, PixelFormat::Rgb24)
    }

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_default_builder() {
        let args = strings(EncoderCommand::new("capture.mp4", layout()).build());

        assert_eq!(
            args,
            [
                "-y", "-f", "rawvideo", "-pix_fmt", "rgb24", "-s", "640x360", "-r", "60", "-i",
                "-", "-vf", "vflip", "-c:v", "libx264", "-preset", "ultrafast", "-crf", "18",
                "-pix_fmt", "yuv420p", "capture.mp4",
            ]
        );
    }

    #[test]
    fn test_audio_is_mapped_and_shortest() {
        let args = strings(
            EncoderCommand::new("out.mp4", layout())
                .with_audio(Some(PathBuf::from("audio.mp3")))
                .build(),
        );

        let audio = args.iter().position(|a| a == "audio.mp3").unwrap();
        assert_eq!(args[audio - 1], "-i");
        assert_eq!(args[audio + 1..audio + 5], ["-map", "0:v:0", "-map", "1:a:0"]);
        assert!(args.contains(&"-shortest".to_string()));
        assert_eq!(args.last().unwrap(), "out.mp4");
    }

    #[test]
    fn test_top_down_rgba_input() {
        let mut layout = FrameLayout::new(2, 2, PixelFormat::Rgba32);
        layout.row_order = RowOrder::TopDown;
        let args = strings(EncoderCommand::new("o.mkv", layout).with_framerate(30).build());

        assert_eq!(args[4], "rgba");
        assert_eq!(args[8], "30");
        assert!(!args.contains(&"vflip".to_string()));
    }
}

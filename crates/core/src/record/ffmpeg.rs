use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    process::{Child, ChildStdin, Command, Stdio},
};

use super::{Encoder, StreamFormat, VideoCodec, VideoFrame};
use crate::{Result, VisualiserError};

type AudioWriter = hound::WavWriter<BufWriter<File>>;

/// Encoder backed by the system `ffmpeg` binary. Frames are streamed to an
/// ffmpeg child as raw RGBA, audio is spooled to a float WAV, and both are
/// muxed into MP4 on [`Encoder::finish`]. Temporary files live in a private
/// work directory removed on finish or drop.
pub struct FfmpegEncoder {
    program: PathBuf,
    codec: VideoCodec,
    work_dir: Option<PathBuf>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    audio: Option<AudioWriter>,
    format: Option<StreamFormat>,
}

impl FfmpegEncoder {
    pub fn new(program: impl Into<PathBuf>, codec: VideoCodec) -> Self {
        Self {
            program: program.into(),
            codec,
            work_dir: None,
            child: None,
            stdin: None,
            audio: None,
            format: None,
        }
    }

    /// Probes `program -encoders` and picks the most preferred codec it
    /// offers.
    pub fn negotiate(program: impl AsRef<Path>) -> Result<Self> {
        let program = program.as_ref();
        let output = Command::new(program)
            .args(["-hide_banner", "-encoders"])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .map_err(|err| {
                VisualiserError::CaptureNotReady(format!(
                    "could not run `{}`: {err}",
                    program.display()
                ))
            })?;

        let listing = String::from_utf8_lossy(&output.stdout);
        let codec = supported_codecs(&listing)
            .into_iter()
            .next()
            .ok_or_else(|| {
                VisualiserError::CaptureNotReady("ffmpeg offers neither libx265 nor libx264".into())
            })?;

        tracing::info!(?codec, "negotiated video codec");
        Ok(Self::new(program, codec))
    }

    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    fn work_dir(&self) -> Result<&Path> {
        self.work_dir
            .as_deref()
            .ok_or_else(|| VisualiserError::Encoder("encoder has not been started".into()))
    }

    fn mux(&self, format: &StreamFormat) -> Result<PathBuf> {
        let dir = self.work_dir()?;
        let output = dir.join("capture.mp4");
        let status = Command::new(&self.program)
            .args(["-hide_banner", "-loglevel", "error", "-y", "-i"])
            .arg(dir.join("video.mp4"))
            .arg("-i")
            .arg(dir.join("audio.wav"))
            .args(["-map", "0:v:0", "-map", "1:a:0", "-c:v", "copy", "-c:a", "aac"])
            .args(["-b:a", "192k", "-movflags", "+faststart", "-t"])
            .arg(format!("{:.3}", format.duration.as_secs_f64()))
            .arg(&output)
            .stdin(Stdio::null())
            .status()?;

        if !status.success() {
            return Err(VisualiserError::Encoder(format!("ffmpeg mux exited with {status}")));
        }
        Ok(output)
    }

    fn cleanup(&mut self) {
        self.stdin = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Some(dir) = self.work_dir.take() {
            if let Err(err) = std::fs::remove_dir_all(&dir) {
                tracing::debug!(%err, dir = %dir.display(), "could not remove capture work dir");
            }
        }
    }
}

/// Codecs named in an `ffmpeg -encoders` listing, most preferred first.
pub(crate) fn supported_codecs(listing: &str) -> Vec<VideoCodec> {
    let names: Vec<&str> = listing
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .collect();

    VideoCodec::PREFERENCE
        .into_iter()
        .filter(|codec| names.contains(&encoder_name(*codec)))
        .collect()
}

fn encoder_name(codec: VideoCodec) -> &'static str {
    match codec {
        VideoCodec::Hevc => "libx265",
        VideoCodec::H264 => "libx264",
    }
}

impl Encoder for FfmpegEncoder {
    fn start(&mut self, format: &StreamFormat) -> Result<()> {
        let dir = std::env::temp_dir().join(format!(
            "beatpose-capture-{}-{}",
            std::process::id(),
            super::timestamp_token()
        ));
        std::fs::create_dir_all(&dir)?;

        let mut command = Command::new(&self.program);
        command
            .args(["-hide_banner", "-loglevel", "error", "-y"])
            .args(["-f", "rawvideo", "-pix_fmt", "rgba"])
            .arg("-s")
            .arg(format!("{}x{}", format.width, format.height))
            .arg("-r")
            .arg(format.fps.to_string())
            .args(["-i", "pipe:0", "-an", "-c:v", encoder_name(self.codec)])
            .arg("-b:v")
            .arg(format.bitrate.to_string())
            .args(["-pix_fmt", "yuv420p", "-vf", "scale=trunc(iw/2)*2:trunc(ih/2)*2"]);
        if self.codec == VideoCodec::Hevc {
            command.args(["-tag:v", "hvc1"]);
        }
        let mut child = command
            .arg(dir.join("video.mp4"))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|err| VisualiserError::CaptureNotReady(format!("could not start ffmpeg: {err}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| VisualiserError::Encoder("ffmpeg stdin unavailable".into()))?;

        let spec = hound::WavSpec {
            channels: format.channels,
            sample_rate: format.sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let audio = hound::WavWriter::create(dir.join("audio.wav"), spec)?;

        tracing::debug!(dir = %dir.display(), codec = ?self.codec, "ffmpeg encoder started");
        self.work_dir = Some(dir);
        self.child = Some(child);
        self.stdin = Some(stdin);
        self.audio = Some(audio);
        self.format = Some(format.clone());
        Ok(())
    }

    fn push_frame(&mut self, frame: &VideoFrame<'_>) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| VisualiserError::Encoder("video stream is closed".into()))?;
        stdin
            .write_all(frame.data)
            .map_err(|err| VisualiserError::Encoder(format!("ffmpeg rejected frame: {err}")))
    }

    fn push_audio(&mut self, samples: &[f32]) -> Result<()> {
        let audio = self
            .audio
            .as_mut()
            .ok_or_else(|| VisualiserError::Encoder("audio stream is closed".into()))?;
        for sample in samples {
            audio.write_sample(*sample)?;
        }
        Ok(())
    }

    fn take_chunks(&mut self) -> Vec<Vec<u8>> {
        Vec::new()
    }

    fn finish(&mut self) -> Result<Vec<Vec<u8>>> {
        let format = self
            .format
            .take()
            .ok_or_else(|| VisualiserError::Encoder("encoder has not been started".into()))?;

        // Closing stdin lets ffmpeg flush the video stream.
        self.stdin = None;
        if let Some(mut child) = self.child.take() {
            let status = child.wait()?;
            if !status.success() {
                self.cleanup();
                return Err(VisualiserError::Encoder(format!(
                    "ffmpeg video encode exited with {status}"
                )));
            }
        }
        if let Some(audio) = self.audio.take() {
            audio.finalize()?;
        }

        let result = self.mux(&format).and_then(|path| std::fs::read(path).map_err(VisualiserError::from));
        self.cleanup();
        Ok(vec![result?])
    }

    fn content_type(&self) -> &str {
        self.codec.content_type()
    }

    fn file_extension(&self) -> &str {
        "mp4"
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
Encoders:
 V..... = Video
 ------
 V....D libx264              libx264 H.264 / AVC / MPEG-4 AVC
 V....D libx265              libx265 H.265 / HEVC
 A....D aac                  AAC (Advanced Audio Coding)
";

    #[test]
    fn prefers_hevc_when_listed() {
        assert_eq!(
            supported_codecs(LISTING),
            vec![VideoCodec::Hevc, VideoCodec::H264]
        );
    }

    #[test]
    fn falls_back_to_h264() {
        let listing = LISTING.replace("libx265", "libfoo");
        assert_eq!(supported_codecs(&listing), vec![VideoCodec::H264]);
        assert!(supported_codecs("Encoders:\n").is_empty());
    }

    #[test]
    fn missing_binary_is_not_ready() {
        let err = FfmpegEncoder::negotiate("/nonexistent/ffmpeg-binary").err().unwrap();
        assert!(matches!(err, VisualiserError::CaptureNotReady(_)));
    }

    #[test]
    fn unstarted_encoder_rejects_input() {
        let mut encoder = FfmpegEncoder::new("ffmpeg", VideoCodec::H264);
        assert!(encoder.push_audio(&[0.0]).is_err());
        assert!(encoder.finish().is_err());
        assert_eq!(encoder.content_type(), "video/mp4; codecs=\"avc1\"");
    }
}

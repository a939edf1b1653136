//! Capture/export pipeline: binds the rendered surface (frame sink) and the
//! audio tap (sample sink) to one [`Encoder`] for a bounded duration, then
//! writes the encoded chunks out as a single file.

use std::{
    fmt,
    path::PathBuf,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::{
    audio::CaptureTap, config::CaptureConfig, render::Surface, AudioEngine, Result,
    VisualiserError,
};

mod ffmpeg;

pub use ffmpeg::FfmpegEncoder;

/// Highest progress reported while still recording.
const MAX_RECORDING_PROGRESS: u8 = 99;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoCodec {
    /// H.265, preferred when the encoder supports it.
    Hevc,
    /// H.264 fallback.
    H264,
}

impl VideoCodec {
    /// Codecs in order of preference.
    pub const PREFERENCE: [VideoCodec; 2] = [VideoCodec::Hevc, VideoCodec::H264];

    pub fn content_type(self) -> &'static str {
        match self {
            VideoCodec::Hevc => "video/mp4; codecs=\"hvc1\"",
            VideoCodec::H264 => "video/mp4; codecs=\"avc1\"",
        }
    }
}

/// Everything an encoder needs to know before the first frame.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFormat {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate: u32,
    pub sample_rate: u32,
    pub channels: u16,
    pub duration: Duration,
}

/// One video frame as premultiplied RGBA8.
#[derive(Debug, Clone, Copy)]
pub struct VideoFrame<'a> {
    pub width: u32,
    pub height: u32,
    pub index: u64,
    pub data: &'a [u8],
}

/// Merges a video frame stream and an audio sample stream into one encoded
/// container.
pub trait Encoder {
    fn start(&mut self, format: &StreamFormat) -> Result<()>;

    fn push_frame(&mut self, frame: &VideoFrame<'_>) -> Result<()>;

    /// Interleaved samples in the format's channel layout.
    fn push_audio(&mut self, samples: &[f32]) -> Result<()>;

    /// Encoded chunks produced since the previous call.
    fn take_chunks(&mut self) -> Vec<Vec<u8>>;

    /// Flushes the encoder and returns the remaining chunks.
    fn finish(&mut self) -> Result<Vec<Vec<u8>>>;

    fn content_type(&self) -> &str;

    fn file_extension(&self) -> &str;
}

pub type EncoderFactory = Box<dyn FnMut(&CaptureConfig) -> Result<Box<dyn Encoder>>>;

/// Default factory: probe the configured ffmpeg binary for the best codec.
pub fn ffmpeg_factory() -> EncoderFactory {
    Box::new(|config: &CaptureConfig| {
        let encoder = FfmpegEncoder::negotiate(&config.ffmpeg_path)?;
        Ok(Box::new(encoder) as Box<dyn Encoder>)
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureState {
    Idle,
    Preparing,
    Recording,
    Finalizing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStart {
    Started,
    /// A session was already running; the request was ignored.
    AlreadyActive,
}

/// Finished export written to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub content_type: String,
    pub size: usize,
    pub frames: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    Progress(u8),
    Completed(Artifact),
}

struct CaptureSession {
    encoder: Box<dyn Encoder>,
    tap: CaptureTap,
    chunks: Vec<Vec<u8>>,
    fps: u32,
    frames: u64,
}

impl CaptureSession {
    fn drain_audio(&mut self) -> Result<()> {
        for block in self.tap.try_iter() {
            self.encoder.push_audio(&block)?;
        }
        self.chunks.extend(self.encoder.take_chunks());
        Ok(())
    }
}

/// `Idle → Preparing → Recording → Finalizing → Idle`. At most one session
/// exists at a time.
pub struct CapturePipeline {
    config: CaptureConfig,
    target: Duration,
    state: CaptureState,
    progress: u8,
    session: Option<CaptureSession>,
    make_encoder: EncoderFactory,
}

impl CapturePipeline {
    pub fn new(config: CaptureConfig, target: Duration, make_encoder: EncoderFactory) -> Self {
        Self {
            config,
            target,
            state: CaptureState::Idle,
            progress: 0,
            session: None,
            make_encoder,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state != CaptureState::Idle
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn target(&self) -> Duration {
        self.target
    }

    pub fn set_target(&mut self, target: Duration) {
        if self.is_active() {
            tracing::warn!("ignoring duration change during capture");
            return;
        }
        self.target = target;
    }

    /// Prepares the engine and begins recording from position zero.
    /// Preconditions are checked before anything is touched, so a rejected
    /// start leaves no partial session behind.
    pub fn start(&mut self, engine: &mut AudioEngine, surface: &Surface) -> Result<CaptureStart> {
        if self.is_active() {
            tracing::warn!(state = ?self.state, "capture already running; ignoring start");
            return Ok(CaptureStart::AlreadyActive);
        }
        let (width, height) = surface
            .device_size()
            .filter(|(w, h)| *w > 0 && *h > 0)
            .ok_or_else(|| VisualiserError::CaptureNotReady("surface has not been sized".into()))?;
        if self.target.is_zero() {
            return Err(VisualiserError::CaptureNotReady(
                "target duration is zero".into(),
            ));
        }

        self.state = CaptureState::Preparing;
        self.progress = 0;
        tracing::info!(target_secs = self.target.as_secs_f32(), "preparing capture");

        match self.begin(engine, width, height) {
            Ok(session) => {
                self.session = Some(session);
                self.state = CaptureState::Recording;
                tracing::info!(width, height, "capture recording");
                Ok(CaptureStart::Started)
            }
            Err(err) => {
                tracing::warn!(%err, "capture failed to start");
                let _ = engine.detach_capture_tap();
                let _ = restore_playback(engine);
                self.state = CaptureState::Idle;
                Err(err)
            }
        }
    }

    fn begin(&mut self, engine: &mut AudioEngine, width: u32, height: u32) -> Result<CaptureSession> {
        engine.pause()?;
        engine.seek_to_start()?;
        engine.set_looping(false)?;
        engine.resume()?;

        let source = engine.source()?;
        let format = StreamFormat {
            width,
            height,
            fps: self.config.fps,
            bitrate: self.config.bitrate,
            sample_rate: source.sample_rate(),
            channels: source.channels(),
            duration: self.target,
        };

        let mut encoder = (self.make_encoder)(&self.config)?;
        encoder.start(&format)?;
        let tap = engine.attach_capture_tap()?;
        engine.play()?;

        Ok(CaptureSession {
            encoder,
            tap,
            chunks: Vec::new(),
            fps: format.fps,
            frames: 0,
        })
    }

    /// Frame sink. Feeds the encoder at the fixed capture rate, keyed to the
    /// audio clock so video and audio stay aligned; repeats the current
    /// frame if rendering fell behind.
    pub fn capture_frame(&mut self, surface: &Surface, engine: &AudioEngine) -> Result<()> {
        if self.state != CaptureState::Recording {
            return Ok(());
        }
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let Some(pixmap) = surface.pixmap() else {
            return Ok(());
        };

        let now = engine.current_time()?.min(self.target.as_secs_f64());
        while (session.frames as f64) / f64::from(session.fps) < now {
            session.encoder.push_frame(&VideoFrame {
                width: pixmap.width(),
                height: pixmap.height(),
                index: session.frames,
                data: pixmap.data(),
            })?;
            session.frames += 1;
        }
        Ok(())
    }

    /// Periodic poll. Moves buffered audio into the encoder, updates progress
    /// and stops the session once the play head reaches the target.
    pub fn poll(&mut self, engine: &mut AudioEngine) -> Result<Option<CaptureEvent>> {
        if self.state != CaptureState::Recording {
            return Ok(None);
        }
        if let Some(session) = self.session.as_mut() {
            session.drain_audio()?;
        }

        let position = engine.current_time()?;
        let target = self.target.as_secs_f64();
        if position >= target {
            engine.pause()?;
            let artifact = self.finalize(engine)?;
            return Ok(Some(CaptureEvent::Completed(artifact)));
        }

        let percent = ((position / target) * 100.0).floor() as u8;
        self.progress = self.progress.max(percent.min(MAX_RECORDING_PROGRESS));
        Ok(Some(CaptureEvent::Progress(self.progress)))
    }

    /// User abort. Stops the encoder and restores playback exactly like a
    /// normal completion; whatever was recorded is still written out.
    pub fn abort(&mut self, engine: &mut AudioEngine) -> Result<Option<Artifact>> {
        if self.state != CaptureState::Recording {
            return Ok(None);
        }
        tracing::info!("capture aborted by user");
        engine.pause()?;
        self.finalize(engine).map(Some)
    }

    fn finalize(&mut self, engine: &mut AudioEngine) -> Result<Artifact> {
        self.state = CaptureState::Finalizing;
        let outcome = match self.session.take() {
            Some(session) => self.write_artifact(session, engine),
            None => Err(VisualiserError::msg("no capture session to finalise")),
        };
        let restored = restore_playback(engine);
        self.state = CaptureState::Idle;

        let artifact = outcome?;
        restored?;
        self.progress = 100;
        tracing::info!(
            path = %artifact.path.display(),
            size = artifact.size,
            frames = artifact.frames,
            "capture complete"
        );
        Ok(artifact)
    }

    fn write_artifact(&self, mut session: CaptureSession, engine: &mut AudioEngine) -> Result<Artifact> {
        session.drain_audio()?;
        engine.detach_capture_tap()?;
        let tail = session.encoder.finish()?;
        session.chunks.extend(tail);

        let bytes = session.chunks.concat();
        let file_name = format!(
            "{}-{}.{}",
            self.config.file_prefix,
            timestamp_token(),
            session.encoder.file_extension()
        );
        std::fs::create_dir_all(&self.config.output_dir)?;
        let path = self.config.output_dir.join(file_name);
        std::fs::write(&path, &bytes)?;

        Ok(Artifact {
            path,
            content_type: session.encoder.content_type().to_string(),
            size: bytes.len(),
            frames: session.frames,
        })
    }
}

impl fmt::Debug for CapturePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturePipeline")
            .field("state", &self.state)
            .field("progress", &self.progress)
            .field("target", &self.target)
            .finish()
    }
}

/// Interactive defaults: looping on, play head at zero.
fn restore_playback(engine: &mut AudioEngine) -> Result<()> {
    engine.set_looping(true)?;
    engine.seek_to_start()
}

fn timestamp_token() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::{
        cell::RefCell,
        rc::Rc,
        sync::Arc,
    };

    use super::*;
    use crate::{AudioMode, AudioSource};

    #[derive(Debug, Default)]
    struct Stats {
        created: usize,
        frames: u64,
        samples: usize,
        finished: bool,
    }

    /// Emits one small chunk per frame so concatenation is observable.
    struct MemoryEncoder {
        stats: Rc<RefCell<Stats>>,
        pending: Vec<Vec<u8>>,
    }

    impl Encoder for MemoryEncoder {
        fn start(&mut self, _format: &StreamFormat) -> Result<()> {
            Ok(())
        }

        fn push_frame(&mut self, frame: &VideoFrame<'_>) -> Result<()> {
            self.stats.borrow_mut().frames += 1;
            self.pending.push(vec![frame.index as u8]);
            Ok(())
        }

        fn push_audio(&mut self, samples: &[f32]) -> Result<()> {
            self.stats.borrow_mut().samples += samples.len();
            Ok(())
        }

        fn take_chunks(&mut self) -> Vec<Vec<u8>> {
            std::mem::take(&mut self.pending)
        }

        fn finish(&mut self) -> Result<Vec<Vec<u8>>> {
            self.stats.borrow_mut().finished = true;
            Ok(vec![b"end".to_vec()])
        }

        fn content_type(&self) -> &str {
            "video/test"
        }

        fn file_extension(&self) -> &str {
            "bin"
        }
    }

    fn pipeline(target_secs: u64, name: &str) -> (CapturePipeline, Rc<RefCell<Stats>>) {
        let stats = Rc::new(RefCell::new(Stats::default()));
        let shared = stats.clone();
        let factory: EncoderFactory = Box::new(move |_config: &CaptureConfig| {
            shared.borrow_mut().created += 1;
            Ok(Box::new(MemoryEncoder {
                stats: shared.clone(),
                pending: Vec::new(),
            }) as Box<dyn Encoder>)
        });
        let config = CaptureConfig {
            output_dir: std::env::temp_dir()
                .join(format!("beatpose-capture-{}-{name}", std::process::id())),
            ..Default::default()
        };
        (
            CapturePipeline::new(config, Duration::from_secs(target_secs), factory),
            stats,
        )
    }

    fn remove_output(path: &std::path::Path) {
        if let Some(dir) = path.parent() {
            std::fs::remove_dir_all(dir).ok();
        }
    }

    fn engine(seconds: usize) -> AudioEngine {
        let source = AudioSource::from_samples(vec![0.1; 8_000 * seconds], 1, 8_000).unwrap();
        AudioEngine::new(Arc::new(source), AudioMode::Manual, 256).unwrap()
    }

    fn surface() -> Surface {
        let mut surface = Surface::new();
        surface.resize(8.0, 8.0, 1.0);
        surface
    }

    #[test]
    fn completes_once_at_target_and_restores_playback() {
        let (mut capture, stats) = pipeline(10, "complete");
        let mut audio = engine(12);
        let surface = surface();

        assert_eq!(
            capture.start(&mut audio, &surface).unwrap(),
            CaptureStart::Started
        );
        assert!(!audio.is_looping().unwrap());

        let mut completions = Vec::new();
        let mut last_progress = 0;
        for _ in 0..150 {
            audio.pump(Duration::from_millis(100)).unwrap();
            capture.capture_frame(&surface, &audio).unwrap();
            match capture.poll(&mut audio).unwrap() {
                Some(CaptureEvent::Progress(p)) => {
                    assert!(p >= last_progress && p <= 99);
                    last_progress = p;
                }
                Some(CaptureEvent::Completed(artifact)) => completions.push(artifact),
                None => {}
            }
        }

        assert_eq!(completions.len(), 1);
        assert_eq!(capture.progress(), 100);
        assert_eq!(capture.state(), CaptureState::Idle);
        assert!(audio.is_looping().unwrap());
        assert_eq!(audio.current_time().unwrap(), 0.0);
        assert!(!audio.is_playing().unwrap());

        let artifact = &completions[0];
        assert_eq!(artifact.content_type, "video/test");
        assert_eq!(artifact.frames, 300);
        let written = std::fs::read(&artifact.path).unwrap();
        assert_eq!(written.len(), artifact.size);
        assert!(written.ends_with(b"end"));
        remove_output(&artifact.path);

        let stats = stats.borrow();
        assert!(stats.finished);
        assert_eq!(stats.samples, 80_000);
    }

    #[test]
    fn second_start_is_ignored() {
        let (mut capture, stats) = pipeline(5, "reentry");
        let mut audio = engine(6);
        let surface = surface();

        capture.start(&mut audio, &surface).unwrap();
        audio.pump(Duration::from_millis(300)).unwrap();
        assert_eq!(
            capture.start(&mut audio, &surface).unwrap(),
            CaptureStart::AlreadyActive
        );
        assert_eq!(stats.borrow().created, 1);
        assert_eq!(capture.state(), CaptureState::Recording);
        assert!(audio.current_time().unwrap() > 0.0);
    }

    #[test]
    fn unsized_surface_is_rejected_without_side_effects() {
        let (mut capture, stats) = pipeline(5, "unsized");
        let mut audio = engine(6);

        let err = capture.start(&mut audio, &Surface::new()).unwrap_err();
        assert!(matches!(err, VisualiserError::CaptureNotReady(_)));
        assert_eq!(capture.state(), CaptureState::Idle);
        assert_eq!(stats.borrow().created, 0);
        assert!(audio.is_looping().unwrap());
    }

    #[test]
    fn failing_encoder_factory_leaves_pipeline_idle() {
        let factory: EncoderFactory = Box::new(|_config: &CaptureConfig| {
            Err(VisualiserError::CaptureNotReady("no encoder".into()))
        });
        let mut capture = CapturePipeline::new(
            CaptureConfig::default(),
            Duration::from_secs(5),
            factory,
        );
        let mut audio = engine(6);

        assert!(capture.start(&mut audio, &surface()).is_err());
        assert_eq!(capture.state(), CaptureState::Idle);
        assert!(audio.is_looping().unwrap());
        assert!(!audio.is_playing().unwrap());
    }

    #[test]
    fn abort_finalises_like_completion() {
        let (mut capture, _stats) = pipeline(10, "abort");
        let mut audio = engine(12);
        let surface = surface();

        capture.start(&mut audio, &surface).unwrap();
        audio.pump(Duration::from_secs(2)).unwrap();
        capture.capture_frame(&surface, &audio).unwrap();
        capture.poll(&mut audio).unwrap();

        let artifact = capture.abort(&mut audio).unwrap().expect("artifact");
        assert_eq!(capture.state(), CaptureState::Idle);
        assert_eq!(capture.progress(), 100);
        assert!(audio.is_looping().unwrap());
        assert_eq!(audio.current_time().unwrap(), 0.0);
        remove_output(&artifact.path);

        assert!(capture.abort(&mut audio).unwrap().is_none());
    }
}

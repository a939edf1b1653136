//! Render session and the fixed-rate loop that drives it.

use std::{
    ops::ControlFlow,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::{
    assets::PoseSet,
    config::AppConfig,
    record::{Artifact, CaptureEvent, CapturePipeline, CaptureStart, CaptureState, EncoderFactory},
    render::{Compositor, Surface},
    scene::RenderState,
    timeline::{Interval, Sequencer},
    AudioEngine, AudioMode, AudioSource, BeatDetector, Result, SpectralAnalyzer, VisualiserError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// No audio source or no base pose: frames are no-ops.
    Idle,
    Active,
}

/// What happened during one tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickOutcome {
    pub drawn: bool,
    pub beat: bool,
    pub bass_level: f32,
    pub capture: Option<CaptureEvent>,
}

/// Owns all per-frame mutable state. Each tick takes it by exclusive
/// reference, so a frame's updates land together.
pub struct RenderSession {
    config: AppConfig,
    poses: PoseSet,
    source: Option<Arc<AudioSource>>,
    engine: Option<AudioEngine>,
    analyzer: SpectralAnalyzer,
    detector: BeatDetector,
    sequencer: Sequencer,
    compositor: Compositor,
    surface: Surface,
    capture: CapturePipeline,
    capture_poll: Interval,
    last_tick: Option<Duration>,
}

impl RenderSession {
    pub fn new(config: AppConfig, make_encoder: EncoderFactory) -> Self {
        let capture = CapturePipeline::new(
            config.capture.clone(),
            Duration::from_secs(u64::from(config.session.duration_secs)),
            make_encoder,
        );
        Self {
            analyzer: SpectralAnalyzer::new(&config.analysis),
            detector: BeatDetector::new(&config.analysis, config.session.reactivity),
            sequencer: Sequencer::new(config.render.stutter_probability),
            compositor: Compositor::new(config.render.bar_count),
            capture_poll: Interval::new(Duration::from_millis(config.capture.poll_interval_ms)),
            surface: Surface::new(),
            poses: PoseSet::new(),
            source: None,
            engine: None,
            last_tick: None,
            capture,
            config,
        }
    }

    /// Replaces the sequencer, e.g. with a seeded one for reproducible output.
    pub fn with_sequencer(mut self, sequencer: Sequencer) -> Self {
        self.sequencer = sequencer;
        self
    }

    pub fn with_compositor(mut self, compositor: Compositor) -> Self {
        self.compositor = compositor;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn set_poses(&mut self, poses: PoseSet) {
        self.poses = poses;
        self.sequencer.reset();
    }

    /// Supplies a new audio source. Any existing engine is torn down; the
    /// next play or export builds a fresh one.
    pub fn set_audio_source(&mut self, source: AudioSource) -> Result<()> {
        if self.capture.is_active() {
            if let Some(engine) = self.engine.as_mut() {
                self.capture.abort(engine)?;
            }
        }
        if self.engine.take().is_some() {
            tracing::info!("audio source changed; engine torn down");
        }
        self.source = Some(Arc::new(source));
        self.analyzer.reset();
        self.detector.reset();
        Ok(())
    }

    pub fn set_reactivity(&mut self, reactivity: u8) {
        self.detector.set_reactivity(reactivity);
        self.config.session.reactivity = reactivity.min(100);
    }

    pub fn set_duration(&mut self, secs: u32) -> Result<()> {
        crate::config::validate_duration(secs)?;
        self.config.session.duration_secs = secs;
        self.capture.set_target(Duration::from_secs(u64::from(secs)));
        Ok(())
    }

    /// Builds the engine on first use.
    pub fn ensure_engine(&mut self) -> Result<&mut AudioEngine> {
        if self.engine.is_none() {
            let source = self
                .source
                .clone()
                .ok_or(VisualiserError::MissingAudioSource)?;
            let mode = if self.config.audio.use_output_device {
                AudioMode::Device
            } else {
                AudioMode::Manual
            };
            let mut engine = AudioEngine::new(source, mode, self.config.analysis.fft_size)?;
            engine.set_looping(self.config.audio.looping)?;
            self.engine = Some(engine);
        }
        self.engine
            .as_mut()
            .ok_or_else(|| VisualiserError::EngineInit("engine unavailable".into()))
    }

    pub fn engine(&self) -> Option<&AudioEngine> {
        self.engine.as_ref()
    }

    pub fn play(&mut self) -> Result<()> {
        self.ensure_engine()?.play()
    }

    pub fn pause(&mut self) -> Result<()> {
        match self.engine.as_mut() {
            Some(engine) => engine.pause(),
            None => Ok(()),
        }
    }

    /// Active once a source and the base pose are present, whether or not
    /// anything is playing.
    pub fn state(&self) -> LoopState {
        if self.source.is_some() && self.poses.has_base() {
            LoopState::Active
        } else {
            LoopState::Idle
        }
    }

    pub fn surface(&self) -> &Surface {
        &self.surface
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    pub fn capture_state(&self) -> CaptureState {
        self.capture.state()
    }

    pub fn capture_progress(&self) -> u8 {
        self.capture.progress()
    }

    /// Starts an export. Sizes the surface first so the encoder sees the
    /// final frame dimensions.
    pub fn start_capture(&mut self) -> Result<CaptureStart> {
        self.resize_surface();
        self.ensure_engine()?;
        let Some(engine) = self.engine.as_mut() else {
            return Err(VisualiserError::CaptureNotReady("audio engine missing".into()));
        };
        let started = self.capture.start(engine, &self.surface)?;
        if started == CaptureStart::Started {
            self.capture_poll.reset();
        }
        Ok(started)
    }

    pub fn abort_capture(&mut self) -> Result<Option<Artifact>> {
        match self.engine.as_mut() {
            Some(engine) => self.capture.abort(engine),
            None => Ok(None),
        }
    }

    /// Runs one frame at `now` (time since the loop started).
    pub fn tick(&mut self, now: Duration) -> Result<TickOutcome> {
        let elapsed = self
            .last_tick
            .map(|last| now.saturating_sub(last))
            .unwrap_or_default();
        self.last_tick = Some(now);
        if let Some(engine) = self.engine.as_mut() {
            engine.pump(elapsed)?;
        }

        self.resize_surface();
        let mut outcome = TickOutcome::default();

        if self.state() == LoopState::Active {
            let spectrum = self.analyzer.analyze(self.engine.as_ref());
            let reading = self.detector.detect(spectrum, now);
            if reading.is_beat {
                self.sequencer.on_beat();
            }

            let state = RenderState::new(reading.bass_level, self.sequencer.index(), now);
            let pose = self.poses.resolve(self.sequencer.current_pose());
            outcome.drawn = self.compositor.render(
                &mut self.surface,
                &state,
                pose,
                spectrum,
                self.sequencer.flash_mut(),
            );
            outcome.beat = reading.is_beat;
            outcome.bass_level = reading.bass_level;
        }

        outcome.capture = self.drive_capture(now)?;
        Ok(outcome)
    }

    fn drive_capture(&mut self, now: Duration) -> Result<Option<CaptureEvent>> {
        if self.capture.state() != CaptureState::Recording {
            return Ok(None);
        }
        let Some(engine) = self.engine.as_mut() else {
            return Ok(None);
        };

        if let Err(err) = self.capture.capture_frame(&self.surface, engine) {
            tracing::warn!(%err, "frame sink failed; stopping capture");
            if let Err(abort_err) = self.capture.abort(engine) {
                tracing::warn!(%abort_err, "capture could not be finalised after sink failure");
            }
            return Err(err);
        }
        if self.capture_poll.due(now) {
            return self.capture.poll(engine);
        }
        Ok(None)
    }

    fn resize_surface(&mut self) {
        let render = &self.config.render;
        self.surface
            .resize(render.width as f32, render.height as f32, render.pixel_ratio);
    }
}

/// Cancels a running [`RenderLoop`] from anywhere.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Repeating task bound to the display refresh rate.
#[derive(Debug)]
pub struct RenderLoop {
    period: Duration,
    stop: StopHandle,
}

impl RenderLoop {
    pub fn new(refresh_hz: u32) -> Self {
        Self {
            period: Interval::from_hz(refresh_hz).period(),
            stop: StopHandle::default(),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Ticks `session` until stopped or `on_tick` breaks. Late frames are not
    /// made up; the schedule restarts from the current time.
    pub fn run<F>(&self, session: &mut RenderSession, mut on_tick: F) -> Result<()>
    where
        F: FnMut(&mut RenderSession, &TickOutcome) -> Result<ControlFlow<()>>,
    {
        let start = Instant::now();
        let mut deadline = Duration::ZERO;
        tracing::debug!(period_ms = self.period.as_secs_f32() * 1000.0, "render loop started");

        while !self.stop.is_stopped() {
            let now = start.elapsed();
            let outcome = session.tick(now)?;
            if on_tick(session, &outcome)?.is_break() {
                break;
            }

            deadline += self.period;
            let elapsed = start.elapsed();
            if deadline > elapsed {
                std::thread::sleep(deadline - elapsed);
            } else {
                deadline = elapsed;
            }
        }

        tracing::debug!("render loop stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::f32::consts::PI;

    use super::*;
    use crate::{
        assets::{PoseId, PoseImage},
        config::CaptureConfig,
        mapping::EffectMapper,
        record::{Encoder, StreamFormat, VideoFrame},
    };

    struct NullEncoder;

    impl Encoder for NullEncoder {
        fn start(&mut self, _format: &StreamFormat) -> Result<()> {
            Ok(())
        }
        fn push_frame(&mut self, _frame: &VideoFrame<'_>) -> Result<()> {
            Ok(())
        }
        fn push_audio(&mut self, _samples: &[f32]) -> Result<()> {
            Ok(())
        }
        fn take_chunks(&mut self) -> Vec<Vec<u8>> {
            Vec::new()
        }
        fn finish(&mut self) -> Result<Vec<Vec<u8>>> {
            Ok(vec![vec![0]])
        }
        fn content_type(&self) -> &str {
            "video/null"
        }
        fn file_extension(&self) -> &str {
            "bin"
        }
    }

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.render.width = 32;
        config.render.height = 32;
        config.session.duration_secs = 5;
        config.capture.output_dir =
            std::env::temp_dir().join(format!("beatpose-driver-{}", std::process::id()));
        config
    }

    fn session() -> RenderSession {
        let factory: EncoderFactory =
            Box::new(|_config: &CaptureConfig| Ok(Box::new(NullEncoder) as Box<dyn Encoder>));
        RenderSession::new(config(), factory)
            .with_sequencer(Sequencer::seeded(0.0, 9))
            .with_compositor(Compositor::with_mapper(8, EffectMapper::seeded(9)))
    }

    fn poses() -> PoseSet {
        let mut poses = PoseSet::new();
        poses.insert(
            PoseId::Base,
            PoseImage::from_rgba(4, 4, &[200; 64]).unwrap(),
        );
        poses
    }

    /// 94 Hz bursts of 100 ms every 500 ms at 48 kHz.
    fn kicks(seconds: usize) -> AudioSource {
        let rate = 48_000;
        let mut samples = vec![0.0_f32; rate * seconds];
        for start in (0..samples.len()).step_by(rate / 2) {
            for i in 0..4_800.min(samples.len() - start) {
                samples[start + i] = (2.0 * PI * 93.75 * i as f32 / rate as f32).sin();
            }
        }
        AudioSource::from_samples(samples, 1, rate as u32).unwrap()
    }

    #[test]
    fn idle_until_audio_and_base_pose() {
        let mut session = session();
        assert_eq!(session.state(), LoopState::Idle);
        let outcome = session.tick(Duration::ZERO).unwrap();
        assert!(!outcome.drawn);

        session.set_poses(poses());
        assert_eq!(session.state(), LoopState::Idle);

        assert!(matches!(
            session.play(),
            Err(VisualiserError::MissingAudioSource)
        ));
        session.set_audio_source(kicks(1)).unwrap();
        assert_eq!(session.state(), LoopState::Active);
        session.play().unwrap();
        assert!(session.tick(Duration::from_millis(16)).unwrap().drawn);
    }

    #[test]
    fn draws_while_paused_without_beats() {
        let mut session = session();
        session.set_poses(poses());
        session.set_audio_source(kicks(1)).unwrap();
        session.ensure_engine().unwrap();

        for frame in 0..30 {
            let outcome = session.tick(Duration::from_millis(frame * 16)).unwrap();
            assert!(outcome.drawn);
            assert!(!outcome.beat);
            assert_eq!(outcome.bass_level, 0.0);
        }
    }

    #[test]
    fn beats_advance_the_sequence() {
        let mut session = session();
        session.set_reactivity(100);
        session.set_poses(poses());
        session.set_audio_source(kicks(3)).unwrap();
        session.play().unwrap();

        let mut beats = 0;
        for frame in 0..180 {
            if session.tick(Duration::from_micros(frame * 16_667)).unwrap().beat {
                beats += 1;
            }
        }
        assert!(beats >= 1, "beats = {beats}");
        assert_eq!(session.sequencer().index(), beats % 6);
    }

    #[test]
    fn new_source_tears_down_engine_but_keeps_drawing() {
        let mut session = session();
        session.set_poses(poses());
        session.set_audio_source(kicks(1)).unwrap();
        session.play().unwrap();
        assert!(session.engine().is_some());

        session.set_audio_source(kicks(1)).unwrap();
        assert!(session.engine().is_none());
        assert_eq!(session.state(), LoopState::Active);
        assert!(session.tick(Duration::from_millis(16)).unwrap().drawn);
    }

    #[test]
    fn draws_before_first_play() {
        let mut session = session();
        session.set_poses(poses());
        session.set_audio_source(kicks(1)).unwrap();
        assert!(session.engine().is_none());
        assert_eq!(session.state(), LoopState::Active);

        let outcome = session.tick(Duration::ZERO).unwrap();
        assert!(outcome.drawn);
        assert!(!outcome.beat);
        assert_eq!(outcome.bass_level, 0.0);
        let centre = session.surface().pixmap().unwrap().pixel(16, 16).unwrap();
        assert_eq!(centre.alpha(), 255);
        assert!(centre.red() > 0);
    }

    #[test]
    fn export_runs_to_completion_on_the_session_clock() {
        let mut session = session();
        session.set_poses(poses());
        session.set_audio_source(kicks(6)).unwrap();
        assert_eq!(session.start_capture().unwrap(), CaptureStart::Started);
        assert_eq!(session.start_capture().unwrap(), CaptureStart::AlreadyActive);

        let mut artifact = None;
        for frame in 0..400_u64 {
            let outcome = session.tick(Duration::from_micros(frame * 16_667)).unwrap();
            if let Some(CaptureEvent::Completed(done)) = outcome.capture {
                artifact = Some(done);
                break;
            }
        }

        let artifact = artifact.expect("capture should complete within the tick budget");
        assert_eq!(session.capture_progress(), 100);
        assert_eq!(session.capture_state(), CaptureState::Idle);
        let engine = session.engine().unwrap();
        assert!(engine.is_looping().unwrap());
        assert_eq!(engine.current_time().unwrap(), 0.0);
        if let Some(dir) = artifact.path.parent() {
            std::fs::remove_dir_all(dir).ok();
        }
    }

    #[test]
    fn sink_failure_stops_capture_and_restores_playback() {
        struct BrokenSink;

        impl Encoder for BrokenSink {
            fn start(&mut self, _format: &StreamFormat) -> Result<()> {
                Ok(())
            }
            fn push_frame(&mut self, _frame: &VideoFrame<'_>) -> Result<()> {
                Err(VisualiserError::Encoder("pipe closed".into()))
            }
            fn push_audio(&mut self, _samples: &[f32]) -> Result<()> {
                Ok(())
            }
            fn take_chunks(&mut self) -> Vec<Vec<u8>> {
                Vec::new()
            }
            fn finish(&mut self) -> Result<Vec<Vec<u8>>> {
                Err(VisualiserError::Encoder("nothing to flush".into()))
            }
            fn content_type(&self) -> &str {
                "video/null"
            }
            fn file_extension(&self) -> &str {
                "bin"
            }
        }

        let factory: EncoderFactory =
            Box::new(|_config: &CaptureConfig| Ok(Box::new(BrokenSink) as Box<dyn Encoder>));
        let mut session = RenderSession::new(config(), factory);
        session.set_poses(poses());
        session.set_audio_source(kicks(6)).unwrap();
        session.start_capture().unwrap();

        session.tick(Duration::ZERO).unwrap();
        let err = session.tick(Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, VisualiserError::Encoder(_)));
        assert_eq!(session.capture_state(), CaptureState::Idle);
        let engine = session.engine().unwrap();
        assert!(engine.is_looping().unwrap());
        assert_eq!(engine.current_time().unwrap(), 0.0);
    }

    #[test]
    fn stop_handle_cancels_loop() {
        let mut session = session();
        let render_loop = RenderLoop::new(1_000);
        let stop = render_loop.stop_handle();
        let mut ticks = 0;
        render_loop
            .run(&mut session, |_, _| {
                ticks += 1;
                if ticks == 3 {
                    stop.stop();
                }
                Ok(ControlFlow::Continue(()))
            })
            .unwrap();
        assert_eq!(ticks, 3);
    }
}

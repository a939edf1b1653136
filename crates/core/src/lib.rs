//! Core library for Beatpose, an audio-reactive pose sequencer.
//!
//! Each frame the render loop pulls a spectrum from the playing track, runs
//! bass-energy beat detection, steps a six-slot pose sequence on beats and
//! composites the current pose with flash, shake and spectrum bars onto an
//! offscreen surface. The same surface and the audio tap can be bound to an
//! encoder to export a fixed-length video clip.

pub mod analysis;
pub mod assets;
pub mod audio;
pub mod config;
pub mod driver;
pub mod error;
pub mod mapping;
pub mod record;
pub mod render;
pub mod scene;
pub mod timeline;

pub use analysis::{
    analyze_source, AnalysisSummary, BeatDetector, BeatEvent, BeatReading, EnergyHistory,
    SpectralAnalyzer, SpectrumSnapshot, TempoEstimator,
};
pub use assets::{PoseId, PoseImage, PoseSet};
pub use audio::{AudioEngine, AudioMode, AudioSource, CaptureTap};
pub use config::{
    AnalysisConfig, AppConfig, AudioConfig, CaptureConfig, RenderConfig, SessionConfig,
};
pub use driver::{LoopState, RenderLoop, RenderSession, StopHandle, TickOutcome};
pub use error::{Result, VisualiserError};
pub use mapping::{EffectMapper, EffectParams};
pub use record::{
    ffmpeg_factory, Artifact, CaptureEvent, CapturePipeline, CaptureStart, CaptureState, Encoder,
    EncoderFactory, FfmpegEncoder, StreamFormat, VideoCodec, VideoFrame,
};
pub use render::{Compositor, Surface};
pub use scene::{FlashEnvelope, RenderState};
pub use timeline::{Interval, Sequencer, POSE_CYCLE};

use std::{
    ops::ControlFlow,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use beatpose_core::{
    analyze_source, ffmpeg_factory, AppConfig, AudioSource, CaptureEvent, CaptureStart, PoseId,
    PoseSet, RenderLoop, RenderSession, VisualiserError,
};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

fn main() -> beatpose_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Export {
            input,
            duration,
            out,
            monitor,
        } => run_export(&input, duration, out, monitor),
        Commands::Preview {
            input,
            seconds,
            snapshot,
        } => run_preview(&input, seconds, snapshot.as_deref()),
        Commands::Analyze(args) => run_analyze(&args),
    }
}

fn run_export(
    input: &SessionArgs,
    duration: Option<u32>,
    out: Option<PathBuf>,
    monitor: bool,
) -> beatpose_core::Result<()> {
    let mut config = input.config()?;
    if let Some(duration) = duration {
        config.session.duration_secs = duration;
    }
    if let Some(out) = out {
        config.capture.output_dir = out;
    }
    config.audio.use_output_device = monitor;
    config.validate()?;

    tracing::info!(
        duration = config.session.duration_secs,
        reactivity = config.session.reactivity,
        monitor,
        "starting export"
    );

    let refresh_hz = config.render.refresh_hz;
    let mut session = input.session(config)?;
    if session.start_capture()? == CaptureStart::AlreadyActive {
        return Err(VisualiserError::msg("an export is already running"));
    }

    let progress = ProgressBar::new(100);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}% ({elapsed})")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .progress_chars("#>-"),
    );

    let mut artifact = None;
    RenderLoop::new(refresh_hz).run(&mut session, |session, outcome| {
        progress.set_position(u64::from(session.capture_progress()));
        if let Some(CaptureEvent::Completed(done)) = &outcome.capture {
            artifact = Some(done.clone());
            return Ok(ControlFlow::Break(()));
        }
        Ok(ControlFlow::Continue(()))
    })?;
    progress.finish_and_clear();

    let artifact = artifact.ok_or_else(|| VisualiserError::msg("export ended without output"))?;
    tracing::info!(
        path = %artifact.path.display(),
        content_type = %artifact.content_type,
        bytes = artifact.size,
        frames = artifact.frames,
        "export written"
    );
    println!("{}", artifact.path.display());
    Ok(())
}

fn run_preview(
    input: &SessionArgs,
    seconds: u64,
    snapshot: Option<&Path>,
) -> beatpose_core::Result<()> {
    let mut config = input.config()?;
    config.audio.use_output_device = true;
    config.validate()?;

    let refresh_hz = config.render.refresh_hz;
    let mut session = input.session(config.clone())?;
    if let Err(err) = session.play() {
        if matches!(err, VisualiserError::MissingAudioSource) {
            return Err(err);
        }
        tracing::warn!(%err, "device playback unavailable; previewing on the wall clock");
        config.audio.use_output_device = false;
        session = input.session(config)?;
        session.play()?;
    }

    let started = Instant::now();
    let limit = Duration::from_secs(seconds);
    RenderLoop::new(refresh_hz).run(&mut session, |session, outcome| {
        if outcome.beat {
            tracing::info!(
                bass = outcome.bass_level,
                index = session.sequencer().index(),
                pose = %session.sequencer().current_pose(),
                "beat"
            );
        }
        if started.elapsed() >= limit {
            return Ok(ControlFlow::Break(()));
        }
        Ok(ControlFlow::Continue(()))
    })?;
    session.pause()?;

    if let Some(path) = snapshot {
        session.surface().save_png(path)?;
        tracing::info!(path = %path.display(), "snapshot written");
    }
    Ok(())
}

fn run_analyze(input: &AnalyzeArgs) -> beatpose_core::Result<()> {
    let mut config = match &input.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    if let Some(reactivity) = input.reactivity {
        config.session.reactivity = reactivity;
    }
    config.validate()?;

    let source = AudioSource::from_wav(&input.audio)?;
    let summary = analyze_source(
        &source,
        &config.analysis,
        config.session.reactivity,
        config.render.refresh_hz,
    )?;

    for beat in &summary.beats {
        println!("{:.3}", beat.at.as_secs_f64());
    }
    match summary.tempo_bpm {
        Some(bpm) => println!("tempo: {bpm:.1} bpm"),
        None => println!("tempo: unknown"),
    }
    println!(
        "{} beats over {:.1}s",
        summary.beats.len(),
        summary.duration_seconds
    );
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Audio-reactive pose sequencer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Render the sequence against a track and export it as a video clip.
    Export {
        #[command(flatten)]
        input: SessionArgs,
        /// Clip length in seconds (5-30, steps of 5).
        #[arg(short, long)]
        duration: Option<u32>,
        /// Directory the clip is written to.
        #[arg(short, long)]
        out: Option<PathBuf>,
        /// Play the track through the default output device while exporting.
        #[arg(long)]
        monitor: bool,
    },
    /// Play the track and log beats as they are detected.
    Preview {
        #[command(flatten)]
        input: SessionArgs,
        /// How long to play before stopping.
        #[arg(short, long, default_value_t = 10)]
        seconds: u64,
        /// Save the last rendered frame as PNG.
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
    /// Run beat detection offline and print beat times and tempo.
    Analyze(AnalyzeArgs),
}

#[derive(Args, Debug)]
struct SessionArgs {
    /// WAV file to sequence against.
    #[arg(short, long)]
    audio: PathBuf,
    /// Base pose image. Missing variants fall back to it.
    #[arg(long)]
    base: PathBuf,
    #[arg(long)]
    var1: Option<PathBuf>,
    #[arg(long)]
    var2: Option<PathBuf>,
    #[arg(long)]
    var3: Option<PathBuf>,
    /// Beat sensitivity, 0-100.
    #[arg(short, long)]
    reactivity: Option<u8>,
    /// JSON config file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl SessionArgs {
    fn config(&self) -> beatpose_core::Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => AppConfig::load(path)?,
            None => AppConfig::default(),
        };
        if let Some(reactivity) = self.reactivity {
            config.session.reactivity = reactivity;
        }
        Ok(config)
    }

    fn poses(&self) -> beatpose_core::Result<PoseSet> {
        let paths = [
            (PoseId::Base, Some(&self.base)),
            (PoseId::Var1, self.var1.as_ref()),
            (PoseId::Var2, self.var2.as_ref()),
            (PoseId::Var3, self.var3.as_ref()),
        ];
        PoseSet::load(
            paths
                .into_iter()
                .filter_map(|(id, path)| path.map(|path| (id, path.as_path()))),
        )
    }

    fn session(&self, config: AppConfig) -> beatpose_core::Result<RenderSession> {
        let mut session = RenderSession::new(config, ffmpeg_factory());
        session.set_poses(self.poses()?);
        session.set_audio_source(AudioSource::from_wav(&self.audio)?)?;
        Ok(session)
    }
}

#[derive(Args, Debug)]
struct AnalyzeArgs {
    /// WAV file to analyse.
    #[arg(short, long)]
    audio: PathBuf,
    #[arg(short, long)]
    reactivity: Option<u8>,
    #[arg(short, long)]
    config: Option<PathBuf>,
}

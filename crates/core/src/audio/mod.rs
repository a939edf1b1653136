use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender};

use crate::{Result, VisualiserError};

mod source;

pub use source::AudioSource;

/// Mode enum describes where rendered audio goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioMode {
    /// Play through the default output device; the device callback advances
    /// the transport.
    Device,
    /// No device. The owner advances the transport with [`AudioEngine::pump`].
    Manual,
}

/// Receiving end of the capture tap. Each message is one block of interleaved
/// samples in the source's channel layout.
pub type CaptureTap = Receiver<Vec<f32>>;

/// Playback state shared between the engine and the device callback.
struct Transport {
    source: Arc<AudioSource>,
    position: usize,
    playing: bool,
    looping: bool,
    analysis_tap: VecDeque<f32>,
    analysis_len: usize,
    capture_tap: Option<Sender<Vec<f32>>>,
}

impl Transport {
    fn new(source: Arc<AudioSource>, analysis_len: usize) -> Self {
        Self {
            source,
            position: 0,
            playing: false,
            looping: true,
            analysis_tap: VecDeque::with_capacity(analysis_len),
            analysis_len,
            capture_tap: None,
        }
    }

    /// Fills `out` (interleaved, `out_channels` wide) and advances the play
    /// head. Paused transports emit silence without moving.
    fn render(&mut self, out: &mut [f32], out_channels: usize) {
        if !self.playing || out_channels == 0 {
            out.fill(0.0);
            return;
        }

        let source = self.source.clone();
        let total_frames = source.frames();
        let source_channels = source.channels() as usize;
        let frames = out.len() / out_channels;
        let mut captured = self
            .capture_tap
            .as_ref()
            .map(|_| Vec::with_capacity(frames * source_channels));

        for frame in out.chunks_exact_mut(out_channels) {
            let current = if self.position < total_frames {
                Some(source.frame(self.position))
            } else {
                None
            };

            match current {
                Some(samples) => {
                    for (channel, slot) in frame.iter_mut().enumerate() {
                        *slot = samples[channel % source_channels];
                    }
                    let mono = samples.iter().sum::<f32>() / source_channels as f32;
                    self.push_analysis(mono);
                    if let Some(captured) = captured.as_mut() {
                        captured.extend_from_slice(samples);
                    }
                }
                None => {
                    // Past the end of a non-looping source: keep the clock
                    // running on silence.
                    frame.fill(0.0);
                    self.push_analysis(0.0);
                    if let Some(captured) = captured.as_mut() {
                        captured.extend(std::iter::repeat(0.0).take(source_channels));
                    }
                }
            }

            self.position += 1;
            if self.looping && self.position >= total_frames {
                self.position = 0;
            }
        }

        if let Some(block) = captured {
            let disconnected = self
                .capture_tap
                .as_ref()
                .map(|tap| tap.send(block).is_err())
                .unwrap_or(false);
            if disconnected {
                self.capture_tap = None;
            }
        }
    }

    fn push_analysis(&mut self, sample: f32) {
        if self.analysis_tap.len() == self.analysis_len {
            self.analysis_tap.pop_front();
        }
        self.analysis_tap.push_back(sample);
    }

    fn current_time(&self) -> f64 {
        self.position as f64 / self.source.sample_rate() as f64
    }
}

struct DeviceOutput {
    stream: cpal::Stream,
    suspended: bool,
}

/// Owns the decoded source, its transport, the analysis tap and (while a
/// capture runs) the capture tap. Drop it and build a new one whenever the
/// source changes.
pub struct AudioEngine {
    mode: AudioMode,
    transport: Arc<Mutex<Transport>>,
    device: Option<DeviceOutput>,
    scratch: Vec<f32>,
    pending_frames: f64,
}

impl AudioEngine {
    /// Builds the audio graph for `source`. `analysis_len` is the number of
    /// mono samples kept for spectral analysis.
    pub fn new(source: Arc<AudioSource>, mode: AudioMode, analysis_len: usize) -> Result<Self> {
        if analysis_len == 0 {
            return Err(VisualiserError::EngineInit(
                "analysis window must hold at least one sample".into(),
            ));
        }

        let transport = Arc::new(Mutex::new(Transport::new(source.clone(), analysis_len)));
        let device = match mode {
            AudioMode::Device => Some(open_device(&source, transport.clone())?),
            AudioMode::Manual => None,
        };

        tracing::info!(
            ?mode,
            sample_rate = source.sample_rate(),
            channels = source.channels(),
            "audio engine ready"
        );

        Ok(Self {
            mode,
            transport,
            device,
            scratch: Vec::new(),
            pending_frames: 0.0,
        })
    }

    /// Returns the currently configured audio mode.
    pub fn mode(&self) -> AudioMode {
        self.mode
    }

    pub fn source(&self) -> Result<Arc<AudioSource>> {
        Ok(self.lock_transport()?.source.clone())
    }

    pub fn play(&mut self) -> Result<()> {
        self.resume()?;
        self.lock_transport()?.playing = true;
        Ok(())
    }

    pub fn pause(&mut self) -> Result<()> {
        self.lock_transport()?.playing = false;
        Ok(())
    }

    pub fn is_playing(&self) -> Result<bool> {
        Ok(self.lock_transport()?.playing)
    }

    pub fn seek_to_start(&mut self) -> Result<()> {
        self.pending_frames = 0.0;
        let mut transport = self.lock_transport()?;
        transport.position = 0;
        transport.analysis_tap.clear();
        Ok(())
    }

    pub fn set_looping(&mut self, looping: bool) -> Result<()> {
        self.lock_transport()?.looping = looping;
        Ok(())
    }

    pub fn is_looping(&self) -> Result<bool> {
        Ok(self.lock_transport()?.looping)
    }

    /// Current play head in seconds.
    pub fn current_time(&self) -> Result<f64> {
        Ok(self.lock_transport()?.current_time())
    }

    /// Whether the output device is held in a suspended state.
    pub fn is_suspended(&self) -> bool {
        self.device.as_ref().map(|d| d.suspended).unwrap_or(false)
    }

    /// Resumes a suspended output device. Manual engines are never suspended.
    pub fn resume(&mut self) -> Result<()> {
        if let Some(device) = self.device.as_mut() {
            if device.suspended {
                device
                    .stream
                    .play()
                    .map_err(|err| VisualiserError::PlaybackBlocked(err.to_string()))?;
                device.suspended = false;
                tracing::debug!("output device resumed");
            }
        }
        Ok(())
    }

    /// Advances a manual transport by `elapsed` wall-clock time, discarding the
    /// rendered samples. Device engines ignore this; the device pulls itself.
    pub fn pump(&mut self, elapsed: Duration) -> Result<()> {
        if self.mode != AudioMode::Manual {
            return Ok(());
        }

        let mut transport = self
            .transport
            .lock()
            .map_err(|_| VisualiserError::msg("audio transport has been poisoned"))?;
        let sample_rate = transport.source.sample_rate() as f64;
        let channels = transport.source.channels() as usize;

        self.pending_frames += elapsed.as_secs_f64() * sample_rate;
        let frames = self.pending_frames.floor();
        self.pending_frames -= frames;
        let frames = frames as usize;
        if frames == 0 {
            return Ok(());
        }

        self.scratch.resize(frames * channels, 0.0);
        transport.render(&mut self.scratch, channels);
        Ok(())
    }

    /// Copies the most recent mono samples into `out`, right-aligned and
    /// zero-padded at the front. Returns `false` without touching `out` when
    /// playback is stopped.
    pub fn copy_analysis_window(&self, out: &mut [f32]) -> Result<bool> {
        let transport = self.lock_transport()?;
        if !transport.playing {
            return Ok(false);
        }

        let available = transport.analysis_tap.len().min(out.len());
        let pad = out.len() - available;
        out[..pad].fill(0.0);
        let skip = transport.analysis_tap.len() - available;
        for (slot, sample) in out[pad..]
            .iter_mut()
            .zip(transport.analysis_tap.iter().skip(skip))
        {
            *slot = *sample;
        }
        Ok(true)
    }

    /// Routes every subsequently rendered block to the returned receiver.
    pub fn attach_capture_tap(&mut self) -> Result<CaptureTap> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        self.lock_transport()?.capture_tap = Some(sender);
        Ok(receiver)
    }

    pub fn detach_capture_tap(&mut self) -> Result<()> {
        self.lock_transport()?.capture_tap = None;
        Ok(())
    }

    fn lock_transport(&self) -> Result<MutexGuard<'_, Transport>> {
        self.transport
            .lock()
            .map_err(|_| VisualiserError::msg("audio transport has been poisoned"))
    }
}

impl fmt::Debug for AudioEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioEngine")
            .field("mode", &self.mode)
            .field("suspended", &self.is_suspended())
            .finish()
    }
}

fn open_device(source: &AudioSource, transport: Arc<Mutex<Transport>>) -> Result<DeviceOutput> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| VisualiserError::EngineInit("no output device available".into()))?;
    let supported = device
        .default_output_config()
        .map_err(|err| VisualiserError::EngineInit(err.to_string()))?;
    if supported.sample_format() != cpal::SampleFormat::F32 {
        return Err(VisualiserError::EngineInit(format!(
            "unsupported output sample format {:?}",
            supported.sample_format()
        )));
    }

    let channels = supported.channels() as usize;
    let config = cpal::StreamConfig {
        channels: supported.channels(),
        sample_rate: cpal::SampleRate(source.sample_rate()),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| match transport.lock() {
                Ok(mut transport) => transport.render(data, channels),
                Err(_) => data.fill(0.0),
            },
            |err| tracing::warn!(%err, "output stream error"),
            None,
        )
        .map_err(|err| VisualiserError::EngineInit(err.to_string()))?;

    // Start suspended; the first play() resumes the stream.
    let suspended = stream.pause().is_ok();

    Ok(DeviceOutput { stream, suspended })
}

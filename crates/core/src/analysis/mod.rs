use std::{f32::consts::PI, fmt, sync::Arc, time::Duration};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};

use crate::{config::AnalysisConfig, AudioEngine, AudioSource, Result};

mod beat;

pub use beat::{
    bass_energy, threshold_multiplier, BeatDetector, BeatEvent, BeatReading, EnergyHistory,
    TempoEstimator, BASS_BINS,
};

/// Byte magnitudes for one analysis frame, one per frequency bin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpectrumSnapshot {
    bins: Vec<u8>,
}

impl SpectrumSnapshot {
    pub fn from_bins(bins: Vec<u8>) -> Self {
        Self { bins }
    }

    pub fn bins(&self) -> &[u8] {
        &self.bins
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }
}

/// Spectrum analyser modelled on a browser analyser node: Blackman window,
/// temporal smoothing, then decibels mapped onto the byte range.
pub struct SpectralAnalyzer {
    fft_size: usize,
    smoothing: f32,
    min_decibels: f32,
    max_decibels: f32,
    window: Vec<f32>,
    time_domain: Vec<f32>,
    smoothed: Vec<f32>,
    snapshot: SpectrumSnapshot,
    fft: FftResources,
}

impl SpectralAnalyzer {
    pub fn new(config: &AnalysisConfig) -> Self {
        let fft_size = config.fft_size;
        let half = fft_size / 2;
        let mut planner = RealFftPlanner::<f32>::new();
        let plan = planner.plan_fft_forward(fft_size);

        Self {
            fft_size,
            smoothing: config.smoothing,
            min_decibels: config.min_decibels,
            max_decibels: config.max_decibels,
            window: (0..fft_size).map(|i| blackman_value(i, fft_size)).collect(),
            time_domain: vec![0.0; fft_size],
            smoothed: vec![0.0; half],
            snapshot: SpectrumSnapshot::from_bins(vec![0; half]),
            fft: FftResources {
                scratch: plan.make_scratch_vec(),
                spectrum: plan.make_output_vec(),
                input: plan.make_input_vec(),
                plan,
            },
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Pulls the engine's most recent samples and returns the new spectrum.
    /// `None` when no engine is attached or playback is stopped. Never fails:
    /// a poisoned transport or FFT error is logged and treated as silence.
    pub fn analyze(&mut self, engine: Option<&AudioEngine>) -> Option<&SpectrumSnapshot> {
        let engine = engine?;
        match engine.copy_analysis_window(&mut self.time_domain) {
            Ok(true) => {}
            Ok(false) => return None,
            Err(err) => {
                tracing::debug!(%err, "analysis window unavailable");
                return None;
            }
        }

        match self.transform() {
            Ok(()) => Some(&self.snapshot),
            Err(err) => {
                tracing::debug!(%err, "spectrum transform failed");
                None
            }
        }
    }

    /// Analyses an explicit window of mono samples (right-aligned, padded
    /// with zeros when shorter than the transform size).
    pub fn analyze_window(&mut self, samples: &[f32]) -> Result<&SpectrumSnapshot> {
        let used = samples.len().min(self.fft_size);
        let pad = self.fft_size - used;
        self.time_domain[..pad].fill(0.0);
        self.time_domain[pad..].copy_from_slice(&samples[samples.len() - used..]);
        self.transform()?;
        Ok(&self.snapshot)
    }

    pub fn reset(&mut self) {
        self.smoothed.fill(0.0);
        self.snapshot.bins.fill(0);
    }

    fn transform(&mut self) -> Result<()> {
        let fft = &mut self.fft;
        for ((slot, sample), weight) in fft
            .input
            .iter_mut()
            .zip(self.time_domain.iter())
            .zip(self.window.iter())
        {
            *slot = sample * weight;
        }

        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)?;

        let scale = 1.0 / self.fft_size as f32;
        let range = (self.max_decibels - self.min_decibels).max(f32::EPSILON);
        for ((smoothed, bin), byte) in self
            .smoothed
            .iter_mut()
            .zip(fft.spectrum.iter())
            .zip(self.snapshot.bins.iter_mut())
        {
            let magnitude = bin.norm() * scale;
            *smoothed = self.smoothing * *smoothed + (1.0 - self.smoothing) * magnitude;
            let decibels = if *smoothed > 0.0 {
                20.0 * smoothed.log10()
            } else {
                f32::NEG_INFINITY
            };
            let level = (decibels - self.min_decibels) / range * 255.0;
            *byte = level.clamp(0.0, 255.0) as u8;
        }

        Ok(())
    }
}

struct FftResources {
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl fmt::Debug for SpectralAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectralAnalyzer")
            .field("fft_size", &self.fft_size)
            .field("smoothing", &self.smoothing)
            .field("min_decibels", &self.min_decibels)
            .field("max_decibels", &self.max_decibels)
            .finish()
    }
}

fn blackman_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }
    let phase = 2.0 * PI * index as f32 / len as f32;
    0.42 - 0.5 * phase.cos() + 0.08 * (2.0 * phase).cos()
}

/// Summary of an offline pass over a whole source.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AnalysisSummary {
    pub sample_rate: u32,
    pub tempo_bpm: Option<f32>,
    pub duration_seconds: f32,
    pub beats: Vec<BeatEvent>,
}

/// Runs analyser and detector over `source` at `refresh_hz`, exactly as the
/// render loop would see it during real-time playback.
pub fn analyze_source(
    source: &AudioSource,
    config: &AnalysisConfig,
    reactivity: u8,
    refresh_hz: u32,
) -> Result<AnalysisSummary> {
    let mut analyzer = SpectralAnalyzer::new(config);
    let mut detector = BeatDetector::new(config, reactivity);
    let mut tempo = TempoEstimator::new();
    let mut beats = Vec::new();

    let channels = source.channels() as usize;
    let mono: Vec<f32> = (0..source.frames())
        .map(|frame| source.frame(frame).iter().sum::<f32>() / channels as f32)
        .collect();

    let frame_period = Duration::from_secs_f64(1.0 / f64::from(refresh_hz.max(1)));
    let mut now = Duration::ZERO;
    let duration = source.duration();

    while now <= duration {
        let end = ((now.as_secs_f64() * f64::from(source.sample_rate())) as usize).min(mono.len());
        let start = end.saturating_sub(config.fft_size);
        let snapshot = analyzer.analyze_window(&mono[start..end])?;
        let reading = detector.detect(Some(snapshot), now);
        if reading.is_beat {
            let beat = BeatEvent { at: now };
            tempo.record(beat);
            beats.push(beat);
        }
        now += frame_period;
    }

    tracing::info!(beats = beats.len(), "offline analysis complete");

    Ok(AnalysisSummary {
        sample_rate: source.sample_rate(),
        tempo_bpm: tempo.bpm(),
        duration_seconds: duration.as_secs_f32(),
        beats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AudioMode;

    fn sine(freq: f32, sample_rate: u32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * PI * freq * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    #[test]
    fn silence_produces_zero_spectrum() {
        let mut analyzer = SpectralAnalyzer::new(&AnalysisConfig::default());
        let snapshot = analyzer.analyze_window(&[0.0; 2048]).unwrap();
        assert_eq!(snapshot.len(), 1024);
        assert!(snapshot.bins().iter().all(|b| *b == 0));
    }

    #[test]
    fn bass_tone_lights_up_low_bins() {
        let config = AnalysisConfig {
            smoothing: 0.0,
            ..Default::default()
        };
        let mut analyzer = SpectralAnalyzer::new(&config);
        // 48 kHz / 2048 = 23.4 Hz per bin, so 117 Hz sits on bin 5.
        let snapshot = analyzer.analyze_window(&sine(117.1875, 48_000, 2048)).unwrap();
        assert_eq!(snapshot.bins()[5], 255);
        assert_eq!(snapshot.bins()[100], 0);
        assert!(bass_energy(snapshot) > 0.3);
    }

    #[test]
    fn smoothing_damps_sudden_silence() {
        let mut analyzer = SpectralAnalyzer::new(&AnalysisConfig::default());
        let tone = sine(117.1875, 48_000, 2048);
        for _ in 0..20 {
            analyzer.analyze_window(&tone).unwrap();
        }
        let loud = analyzer.analyze_window(&tone).unwrap().bins()[5];
        let after = analyzer.analyze_window(&[0.0; 2048]).unwrap().bins()[5];
        assert!(after > 0 && after <= loud);
    }

    #[test]
    fn no_engine_or_paused_engine_yields_absence() {
        let mut analyzer = SpectralAnalyzer::new(&AnalysisConfig::default());
        assert!(analyzer.analyze(None).is_none());

        let source = AudioSource::from_samples(vec![0.2; 48_000], 1, 48_000).unwrap();
        let engine = AudioEngine::new(Arc::new(source), AudioMode::Manual, 2048).unwrap();
        assert!(analyzer.analyze(Some(&engine)).is_none());
    }

    #[test]
    fn offline_pass_finds_pulses() {
        let sample_rate = 48_000;
        let mut samples = vec![0.0_f32; sample_rate as usize * 4];
        // Bass bursts every 500 ms.
        for pulse in 0..8 {
            let start = pulse * sample_rate as usize / 2;
            for (i, sample) in sine(93.75, sample_rate, 4_800).into_iter().enumerate() {
                samples[start + i] = sample;
            }
        }
        let source = AudioSource::from_samples(samples, 1, sample_rate).unwrap();
        let config = AnalysisConfig {
            smoothing: 0.0,
            ..Default::default()
        };
        let summary = analyze_source(&source, &config, 100, 60).unwrap();

        assert!(summary.beats.len() >= 4);
        for pair in summary.beats.windows(2) {
            assert!(pair[1].at - pair[0].at >= Duration::from_millis(200));
        }
    }
}

use std::{collections::VecDeque, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{config::AnalysisConfig, SpectrumSnapshot};

/// Low-frequency bins averaged into the bass energy, inclusive. With a 2048
/// point transform at 44.1–48 kHz this spans roughly 40–190 Hz.
pub const BASS_BINS: std::ops::RangeInclusive<usize> = 2..=8;

const MAX_TEMPO_HISTORY: usize = 32;

/// Bounded FIFO of recent bass energies used for the rolling baseline.
#[derive(Debug, Clone)]
pub struct EnergyHistory {
    samples: VecDeque<f32>,
    capacity: usize,
}

impl EnergyHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, energy: f32) {
        if self.capacity == 0 {
            return;
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(energy);
    }

    /// Arithmetic mean, or 0 for an empty history.
    pub fn mean(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f32>() / self.samples.len() as f32
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &f32> {
        self.samples.iter()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Moment at which a beat was accepted, relative to the session start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BeatEvent {
    pub at: Duration,
}

/// Outcome of one detection step.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BeatReading {
    pub is_beat: bool,
    /// Normalised bass energy in [0, 1].
    pub bass_level: f32,
}

/// Multiplier applied to the rolling baseline; 1.5 at reactivity 0 down to
/// 1.0 at reactivity 100.
pub fn threshold_multiplier(reactivity: u8) -> f32 {
    1.5 - f32::from(reactivity.min(100)) / 200.0
}

/// Mean magnitude of [`BASS_BINS`], normalised by the byte range.
pub fn bass_energy(snapshot: &SpectrumSnapshot) -> f32 {
    let bins = snapshot.bins();
    let start = *BASS_BINS.start();
    if bins.len() <= start {
        return 0.0;
    }
    let end = (*BASS_BINS.end()).min(bins.len() - 1);
    let range = &bins[start..=end];
    let sum: u32 = range.iter().map(|b| u32::from(*b)).sum();
    sum as f32 / range.len() as f32 / f32::from(u8::MAX)
}

/// Adaptive-threshold onset detector over bass energy with a refractory
/// period between accepted beats.
#[derive(Debug, Clone)]
pub struct BeatDetector {
    history: EnergyHistory,
    reactivity: u8,
    refractory: Duration,
    bass_floor: f32,
    last_beat: Option<BeatEvent>,
}

impl BeatDetector {
    pub fn new(config: &AnalysisConfig, reactivity: u8) -> Self {
        Self {
            history: EnergyHistory::new(config.history_len),
            reactivity: reactivity.min(100),
            refractory: Duration::from_millis(config.refractory_ms),
            bass_floor: config.bass_floor,
            last_beat: None,
        }
    }

    pub fn reactivity(&self) -> u8 {
        self.reactivity
    }

    pub fn set_reactivity(&mut self, reactivity: u8) {
        self.reactivity = reactivity.min(100);
    }

    pub fn history(&self) -> &EnergyHistory {
        &self.history
    }

    pub fn last_beat(&self) -> Option<BeatEvent> {
        self.last_beat
    }

    /// Threshold the current bass level must exceed for the given baseline.
    pub fn threshold(&self, baseline: f32) -> f32 {
        baseline * threshold_multiplier(self.reactivity)
    }

    /// Runs one detection step. A missing snapshot (nothing playing) yields
    /// zero bass and leaves the history untouched.
    pub fn detect(&mut self, snapshot: Option<&SpectrumSnapshot>, now: Duration) -> BeatReading {
        let Some(snapshot) = snapshot else {
            return BeatReading::default();
        };

        let bass_level = bass_energy(snapshot);
        self.history.push(bass_level);
        let baseline = self.history.mean();

        let is_beat = self.accepts(bass_level, baseline, now);
        if is_beat {
            self.last_beat = Some(BeatEvent { at: now });
            tracing::debug!(
                at_ms = now.as_millis() as u64,
                bass_level,
                baseline,
                "beat"
            );
        }

        BeatReading {
            is_beat,
            bass_level,
        }
    }

    fn accepts(&self, bass_level: f32, baseline: f32, now: Duration) -> bool {
        if baseline <= 0.0 {
            return false;
        }
        if bass_level <= self.threshold(baseline) || bass_level <= self.bass_floor {
            return false;
        }
        self.last_beat
            .map(|last| now.saturating_sub(last.at) >= self.refractory)
            .unwrap_or(true)
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.last_beat = None;
    }
}

/// Average tempo over the most recent accepted beats.
#[derive(Debug, Clone, Default)]
pub struct TempoEstimator {
    beats: Vec<Duration>,
}

impl TempoEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, beat: BeatEvent) {
        self.beats.push(beat.at);
        if self.beats.len() > MAX_TEMPO_HISTORY {
            let overflow = self.beats.len() - MAX_TEMPO_HISTORY;
            self.beats.drain(0..overflow);
        }
    }

    pub fn bpm(&self) -> Option<f32> {
        if self.beats.len() < 2 {
            return None;
        }

        let mut sum = 0.0;
        let mut count = 0;
        for window in self.beats.windows(2) {
            let interval = (window[1] - window[0]).as_secs_f32();
            if interval > f32::EPSILON {
                sum += interval;
                count += 1;
            }
        }

        if count == 0 {
            return None;
        }
        Some(60.0 / (sum / count as f32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_with_bass(level: u8) -> SpectrumSnapshot {
        let mut bins = vec![0_u8; 1024];
        for bin in BASS_BINS {
            bins[bin] = level;
        }
        SpectrumSnapshot::from_bins(bins)
    }

    fn detector(reactivity: u8) -> BeatDetector {
        BeatDetector::new(&AnalysisConfig::default(), reactivity)
    }

    #[test]
    fn empty_history_has_zero_baseline_and_never_fires() {
        let history = EnergyHistory::new(60);
        assert_eq!(history.mean(), 0.0);

        let detector = detector(100);
        for bass in [0.0, 0.31, 0.5, 1.0] {
            assert!(!detector.accepts(bass, history.mean(), Duration::from_secs(5)));
        }
    }

    #[test]
    fn history_is_bounded_fifo() {
        let mut history = EnergyHistory::new(60);
        for i in 0..150 {
            history.push(i as f32);
            assert!(history.len() <= 60);
        }
        assert_eq!(history.len(), 60);
        assert_eq!(history.iter().next().copied(), Some(90.0));
        assert_eq!(history.iter().last().copied(), Some(149.0));
    }

    #[test]
    fn bass_energy_is_normalised_mean_of_low_bins() {
        assert_eq!(bass_energy(&snapshot_with_bass(255)), 1.0);
        assert_eq!(bass_energy(&snapshot_with_bass(0)), 0.0);
        assert_eq!(bass_energy(&SpectrumSnapshot::default()), 0.0);
    }

    #[test]
    fn absent_snapshot_means_silence() {
        let mut detector = detector(50);
        let reading = detector.detect(None, Duration::from_secs(1));
        assert_eq!(reading, BeatReading::default());
        assert!(detector.history().is_empty());
    }

    #[test]
    fn threshold_decreases_strictly_with_reactivity() {
        let baseline = 0.4;
        let mut previous = f32::INFINITY;
        for reactivity in 0..=100 {
            let threshold = detector(reactivity).threshold(baseline);
            assert!(threshold < previous, "reactivity {reactivity}");
            previous = threshold;
        }
        assert_eq!(threshold_multiplier(0), 1.5);
        assert_eq!(threshold_multiplier(100), 1.0);
    }

    #[test]
    fn fires_on_spike_above_baseline() {
        let mut detector = detector(50);
        for frame in 0..30 {
            let reading = detector.detect(
                Some(&snapshot_with_bass(60)),
                Duration::from_millis(frame * 16),
            );
            assert!(!reading.is_beat);
        }

        let reading = detector.detect(Some(&snapshot_with_bass(230)), Duration::from_millis(500));
        assert!(reading.is_beat);
        assert_eq!(
            detector.last_beat(),
            Some(BeatEvent {
                at: Duration::from_millis(500)
            })
        );
    }

    #[test]
    fn quiet_spikes_stay_below_absolute_floor() {
        let mut detector = detector(100);
        for frame in 0..30 {
            detector.detect(Some(&snapshot_with_bass(5)), Duration::from_millis(frame * 16));
        }
        // 60/255 is well above the baseline but under the 0.3 floor.
        let reading = detector.detect(Some(&snapshot_with_bass(60)), Duration::from_secs(1));
        assert!(!reading.is_beat);
    }

    #[test]
    fn debounce_keeps_beats_at_least_refractory_apart() {
        let mut detector = detector(100);
        let mut accepted = Vec::new();

        for step in 0..200_u64 {
            let now = Duration::from_millis(step * 50);
            if detector.detect(Some(&snapshot_with_bass(250)), now).is_beat {
                accepted.push(now);
            }
            // Quiet frames keep the baseline low between 50 ms spikes.
            for sub in 1..4 {
                let quiet = now + Duration::from_millis(sub * 10);
                detector.detect(Some(&snapshot_with_bass(10)), quiet);
            }
        }

        assert!(accepted.len() > 1);
        for pair in accepted.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(200));
        }
        let per_window = accepted
            .iter()
            .filter(|t| **t < Duration::from_millis(200))
            .count();
        assert!(per_window <= 1);
    }

    #[test]
    fn tempo_from_regular_beats() {
        let mut tempo = TempoEstimator::new();
        assert!(tempo.bpm().is_none());
        for i in 0..8 {
            tempo.record(BeatEvent {
                at: Duration::from_millis(i * 500),
            });
        }
        let bpm = tempo.bpm().unwrap();
        assert!((bpm - 120.0).abs() < 0.5);
    }
}

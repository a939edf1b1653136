use std::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{assets::PoseId, scene::FlashEnvelope};

/// Ping-pong traversal of the poses expressed as a fixed cycle.
pub const POSE_CYCLE: [PoseId; 6] = [
    PoseId::Base,
    PoseId::Var1,
    PoseId::Var2,
    PoseId::Var3,
    PoseId::Var2,
    PoseId::Var1,
];

/// Extra steps taken on a stutter beat.
pub const STUTTER_STEP: usize = 2;
pub const DEFAULT_STUTTER_PROBABILITY: f64 = 0.1;

/// Beat-driven pose state machine. Owns the beat flash so both are updated
/// in the same step.
#[derive(Debug, Clone)]
pub struct Sequencer {
    index: usize,
    stutter_probability: f64,
    rng: StdRng,
    flash: FlashEnvelope,
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new(DEFAULT_STUTTER_PROBABILITY)
    }
}

impl Sequencer {
    pub fn new(stutter_probability: f64) -> Self {
        Self::with_rng(stutter_probability, StdRng::from_os_rng())
    }

    /// Deterministic sequencer for reproducible renders and tests.
    pub fn seeded(stutter_probability: f64, seed: u64) -> Self {
        Self::with_rng(stutter_probability, StdRng::seed_from_u64(seed))
    }

    fn with_rng(stutter_probability: f64, rng: StdRng) -> Self {
        Self {
            index: 0,
            stutter_probability: stutter_probability.clamp(0.0, 1.0),
            rng,
            flash: FlashEnvelope::default(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn current_pose(&self) -> PoseId {
        POSE_CYCLE[self.index]
    }

    pub fn flash(&self) -> &FlashEnvelope {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut FlashEnvelope {
        &mut self.flash
    }

    /// Moves one step along the cycle.
    pub fn advance(&mut self) {
        self.index = (self.index + 1) % POSE_CYCLE.len();
    }

    /// Handles an accepted beat: advance, maybe stutter ahead, and re-arm the
    /// flash. Returns the new index.
    pub fn on_beat(&mut self) -> usize {
        self.advance();
        if self.rng.random_bool(self.stutter_probability) {
            self.index = (self.index + STUTTER_STEP) % POSE_CYCLE.len();
            tracing::trace!(index = self.index, "stutter");
        }
        self.flash.trigger();
        self.index
    }

    pub fn reset(&mut self) {
        self.index = 0;
        self.flash = FlashEnvelope::default();
    }
}

/// Fixed-cadence trigger on a monotonic timeline. Missed periods are skipped
/// rather than replayed in a burst.
#[derive(Debug, Clone, Copy)]
pub struct Interval {
    period: Duration,
    next: Option<Duration>,
}

impl Interval {
    pub fn new(period: Duration) -> Self {
        Self { period, next: None }
    }

    pub fn from_hz(hz: u32) -> Self {
        Self::new(Duration::from_secs_f64(1.0 / f64::from(hz.max(1))))
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Returns `true` if a period boundary has been reached at `now`. The
    /// first call always fires.
    pub fn due(&mut self, now: Duration) -> bool {
        match self.next {
            Some(next) if now < next => false,
            Some(next) => {
                let mut upcoming = next + self.period;
                if upcoming <= now {
                    upcoming = now + self.period;
                }
                self.next = Some(upcoming);
                true
            }
            None => {
                self.next = Some(now + self.period);
                true
            }
        }
    }

    pub fn reset(&mut self) {
        self.next = None;
    }
}

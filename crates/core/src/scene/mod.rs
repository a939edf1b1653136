use std::time::Duration;

/// Per-frame decay applied to the beat flash.
pub const FLASH_DECAY: f32 = 0.85;
/// Below this level the flash overlay is skipped.
pub const FLASH_CUTOFF: f32 = 0.01;

/// Decaying flash intensity, re-armed to 1.0 on every accepted beat.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FlashEnvelope {
    level: f32,
}

impl FlashEnvelope {
    pub fn level(&self) -> f32 {
        self.level
    }

    pub fn trigger(&mut self) {
        self.level = 1.0;
    }

    /// Applies one frame of decay and returns the new level.
    pub fn decay(&mut self) -> f32 {
        self.level *= FLASH_DECAY;
        self.level
    }

    pub fn is_visible(&self) -> bool {
        self.level > FLASH_CUTOFF
    }
}

/// Ephemeral scalars handed to the compositor for a single frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RenderState {
    pub bass_level: f32,
    pub sequence_index: usize,
    /// Time since the render session started.
    pub time: Duration,
}

impl RenderState {
    pub fn new(bass_level: f32, sequence_index: usize, time: Duration) -> Self {
        Self {
            bass_level: bass_level.clamp(0.0, 1.0),
            sequence_index,
            time,
        }
    }
}

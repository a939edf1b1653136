//! Maps per-frame audio features onto the compositor's visual parameters.

use std::f32::consts::PI;

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::scene::RenderState;

/// Maximum extra scale at full bass.
pub const THUMP_GAIN: f32 = 0.05;
/// Bass level above which the image shakes.
pub const SHAKE_THRESHOLD: f32 = 0.6;
/// Peak shake offset per axis, in logical pixels.
pub const SHAKE_AMPLITUDE: f32 = 5.0;
/// Divisor applied to the millisecond clock inside the wobble sine.
pub const WOBBLE_TIME_SCALE_MS: f32 = 500.0;
pub const WOBBLE_GAIN: f32 = 0.01;
pub const BASS_TWIST_GAIN: f32 = 0.02;
/// Exponent biasing spectrum bars towards low bins.
pub const BAR_CURVE: f32 = 1.5;

/// Transform applied to the pose for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectParams {
    /// Uniform scale from image pixels to surface pixels, thump included.
    pub scale: f32,
    /// Shake offset in surface pixels.
    pub offset: (f32, f32),
    /// Rotation in radians.
    pub rotation: f32,
}

/// Largest uniform scale that fits the image inside the surface.
pub fn fit_scale(image: (u32, u32), surface: (u32, u32)) -> f32 {
    if image.0 == 0 || image.1 == 0 {
        return 0.0;
    }
    (surface.0 as f32 / image.0 as f32).min(surface.1 as f32 / image.1 as f32)
}

pub fn thump(bass_level: f32) -> f32 {
    1.0 + bass_level * THUMP_GAIN
}

/// Slow wobble plus a bass twist whose direction flips with sequence parity.
pub fn rotation(state: &RenderState) -> f32 {
    let millis = state.time.as_secs_f32() * 1000.0;
    let wobble = (millis / WOBBLE_TIME_SCALE_MS).sin() * WOBBLE_GAIN;
    let direction = if state.sequence_index % 2 == 0 { 1.0 } else { -1.0 };
    wobble + state.bass_level * BASS_TWIST_GAIN * direction
}

/// Spectrum bin feeding bar `index` of `bar_count`.
pub fn bar_bin(index: usize, bar_count: usize, half_len: usize) -> usize {
    if bar_count == 0 || half_len == 0 {
        return 0;
    }
    let position = (index as f32 / bar_count as f32).powf(BAR_CURVE);
    ((position * half_len as f32).floor() as usize).min(half_len - 1)
}

/// Normalised bar heights for one side of the mirrored visualisation.
pub fn bar_levels(bins: &[u8], bar_count: usize, out: &mut Vec<f32>) {
    out.clear();
    let half_len = bins.len() / 2;
    if half_len == 0 {
        out.resize(bar_count, 0.0);
        return;
    }
    out.extend(
        (0..bar_count).map(|i| f32::from(bins[bar_bin(i, bar_count, half_len)]) / 255.0),
    );
}

/// Derives [`EffectParams`] from the render state. Owns the RNG used for
/// shake so renders can be made reproducible.
#[derive(Debug, Clone)]
pub struct EffectMapper {
    rng: StdRng,
}

impl Default for EffectMapper {
    fn default() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }
}

impl EffectMapper {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn map(
        &mut self,
        state: &RenderState,
        image: (u32, u32),
        surface: (u32, u32),
        pixel_ratio: f32,
    ) -> EffectParams {
        let scale = fit_scale(image, surface) * thump(state.bass_level);
        let offset = if state.bass_level > SHAKE_THRESHOLD {
            let amplitude = SHAKE_AMPLITUDE * pixel_ratio;
            (
                self.rng.random_range(-1.0..=1.0) * amplitude,
                self.rng.random_range(-1.0..=1.0) * amplitude,
            )
        } else {
            (0.0, 0.0)
        };

        EffectParams {
            scale,
            offset,
            rotation: rotation(state),
        }
    }
}

/// Converts radians to the degrees tiny-skia expects.
pub fn to_degrees(radians: f32) -> f32 {
    radians * 180.0 / PI
}

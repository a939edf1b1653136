use std::path::Path;

use tiny_skia::{
    BlendMode, Color, FilterQuality, Paint, Pixmap, PixmapPaint, Rect, Transform,
};

use crate::{
    assets::PoseImage,
    mapping::{self, EffectMapper},
    scene::{FlashEnvelope, RenderState},
    Result, SpectrumSnapshot, VisualiserError,
};

/// Opacity of the flash overlay at full intensity.
pub const FLASH_MAX_ALPHA: f32 = 0.15;
/// Bar height at full magnitude, relative to the surface height.
pub const BAR_HEIGHT_RATIO: f32 = 0.3;
const BAR_ALPHA: u8 = 90;

/// Backing pixel buffer sized to the display box times the pixel ratio.
#[derive(Debug, Default)]
pub struct Surface {
    pixmap: Option<Pixmap>,
    pixel_ratio: f32,
}

impl Surface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Matches the surface to a `width` × `height` logical box. Reallocates
    /// only when the device pixel size changes; returns whether it did.
    pub fn resize(&mut self, width: f32, height: f32, pixel_ratio: f32) -> bool {
        let pixel_ratio = if pixel_ratio > 0.0 { pixel_ratio } else { 1.0 };
        let device_width = (width * pixel_ratio).round().max(0.0) as u32;
        let device_height = (height * pixel_ratio).round().max(0.0) as u32;
        self.pixel_ratio = pixel_ratio;

        if self.device_size() == Some((device_width, device_height)) {
            return false;
        }

        self.pixmap = Pixmap::new(device_width, device_height);
        tracing::debug!(device_width, device_height, pixel_ratio, "surface resized");
        true
    }

    pub fn device_size(&self) -> Option<(u32, u32)> {
        self.pixmap.as_ref().map(|p| (p.width(), p.height()))
    }

    pub fn pixel_ratio(&self) -> f32 {
        self.pixel_ratio
    }

    pub fn is_ready(&self) -> bool {
        self.pixmap.is_some()
    }

    pub fn pixmap(&self) -> Option<&Pixmap> {
        self.pixmap.as_ref()
    }

    /// Premultiplied RGBA8 bytes of the current frame.
    pub fn data(&self) -> Option<&[u8]> {
        self.pixmap.as_ref().map(|p| p.data())
    }

    pub fn save_png(&self, path: impl AsRef<Path>) -> Result<()> {
        let pixmap = self
            .pixmap
            .as_ref()
            .ok_or_else(|| VisualiserError::msg("surface has not been sized yet"))?;
        pixmap
            .save_png(path)
            .map_err(|err| VisualiserError::msg(err.to_string()))
    }
}

/// Draws one frame: pose with thump/shake/rotation, beat flash and the
/// mirrored spectrum bars.
#[derive(Debug)]
pub struct Compositor {
    bar_count: usize,
    mapper: EffectMapper,
    bars: Vec<f32>,
}

impl Compositor {
    pub fn new(bar_count: usize) -> Self {
        Self::with_mapper(bar_count, EffectMapper::default())
    }

    pub fn with_mapper(bar_count: usize, mapper: EffectMapper) -> Self {
        Self {
            bar_count,
            mapper,
            bars: Vec::with_capacity(bar_count),
        }
    }

    /// Renders into `surface`. Returns `false` and leaves the surface alone
    /// when there is nothing to draw yet (no pose or unsized surface).
    pub fn render(
        &mut self,
        surface: &mut Surface,
        state: &RenderState,
        pose: Option<&PoseImage>,
        spectrum: Option<&SpectrumSnapshot>,
        flash: &mut FlashEnvelope,
    ) -> bool {
        let pixel_ratio = surface.pixel_ratio();
        let (Some(pose), Some(pixmap)) = (pose, surface.pixmap.as_mut()) else {
            return false;
        };

        let width = pixmap.width() as f32;
        let height = pixmap.height() as f32;
        pixmap.fill(Color::BLACK);

        let params = self.mapper.map(
            state,
            (pose.width(), pose.height()),
            (pixmap.width(), pixmap.height()),
            pixel_ratio,
        );
        let transform = Transform::from_translate(
            width / 2.0 + params.offset.0,
            height / 2.0 + params.offset.1,
        )
        .pre_rotate(mapping::to_degrees(params.rotation))
        .pre_scale(params.scale, params.scale)
        .pre_translate(-(pose.width() as f32) / 2.0, -(pose.height() as f32) / 2.0);

        let paint = PixmapPaint {
            quality: FilterQuality::Bilinear,
            ..PixmapPaint::default()
        };
        pixmap.draw_pixmap(0, 0, pose.pixmap().as_ref(), &paint, transform, None);

        flash.decay();
        if flash.is_visible() {
            draw_flash(pixmap, flash.level());
        }

        if let Some(spectrum) = spectrum {
            mapping::bar_levels(spectrum.bins(), self.bar_count, &mut self.bars);
            draw_bars(pixmap, &self.bars);
        }

        true
    }
}

fn draw_flash(pixmap: &mut Pixmap, level: f32) {
    let Some(rect) = Rect::from_xywh(0.0, 0.0, pixmap.width() as f32, pixmap.height() as f32)
    else {
        return;
    };
    let alpha = (level * FLASH_MAX_ALPHA).min(FLASH_MAX_ALPHA);

    let mut paint = Paint::default();
    paint.set_color(Color::from_rgba(1.0, 1.0, 1.0, alpha).unwrap_or(Color::TRANSPARENT));
    paint.blend_mode = BlendMode::Screen;
    pixmap.fill_rect(rect, &paint, Transform::identity(), None);
}

fn draw_bars(pixmap: &mut Pixmap, levels: &[f32]) {
    if levels.is_empty() {
        return;
    }

    let width = pixmap.width() as f32;
    let height = pixmap.height() as f32;
    let centre = width / 2.0;
    let bar_width = centre / levels.len() as f32;
    let gap = (bar_width * 0.2).min(2.0);

    let mut paint = Paint::default();
    paint.set_color_rgba8(255, 255, 255, BAR_ALPHA);
    paint.anti_alias = true;

    for (i, level) in levels.iter().enumerate() {
        let bar_height = level * height * BAR_HEIGHT_RATIO;
        let top = height - bar_height;
        let right = centre + i as f32 * bar_width;
        let left = centre - (i + 1) as f32 * bar_width;

        for x in [left, right] {
            // Zero-height bars yield no rect.
            if let Some(rect) = Rect::from_xywh(x, top, bar_width - gap, bar_height) {
                pixmap.fill_rect(rect, &paint, Transform::identity(), None);
            }
        }
    }
}

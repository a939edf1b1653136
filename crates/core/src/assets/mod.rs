use std::{collections::HashMap, fmt, path::Path, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};
use tiny_skia::{ColorU8, Pixmap};

use crate::{Result, VisualiserError};

/// Identifier of one of the four generated poses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoseId {
    Base,
    Var1,
    Var2,
    Var3,
}

impl PoseId {
    pub const ALL: [PoseId; 4] = [PoseId::Base, PoseId::Var1, PoseId::Var2, PoseId::Var3];

    pub fn as_str(self) -> &'static str {
        match self {
            PoseId::Base => "base",
            PoseId::Var1 => "var1",
            PoseId::Var2 => "var2",
            PoseId::Var3 => "var3",
        }
    }
}

impl fmt::Display for PoseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PoseId {
    type Err = VisualiserError;

    fn from_str(value: &str) -> Result<Self> {
        PoseId::ALL
            .into_iter()
            .find(|id| id.as_str() == value)
            .ok_or_else(|| VisualiserError::msg(format!("unknown pose `{value}`")))
    }
}

/// Decoded pose raster, premultiplied and ready to draw.
#[derive(Clone)]
pub struct PoseImage {
    pixmap: Arc<Pixmap>,
}

impl PoseImage {
    /// Wraps straight (non-premultiplied) RGBA8 pixels.
    pub fn from_rgba(width: u32, height: u32, data: &[u8]) -> Result<Self> {
        let mut pixmap = Pixmap::new(width, height)
            .ok_or(VisualiserError::InvalidInput("pose image has zero size"))?;
        if data.len() != pixmap.pixels().len() * 4 {
            return Err(VisualiserError::InvalidInput(
                "pose pixel buffer does not match its dimensions",
            ));
        }

        for (pixel, rgba) in pixmap.pixels_mut().iter_mut().zip(data.chunks_exact(4)) {
            *pixel = ColorU8::from_rgba(rgba[0], rgba[1], rgba[2], rgba[3]).premultiply();
        }

        Ok(Self {
            pixmap: Arc::new(pixmap),
        })
    }

    /// Decodes any format supported by the `image` crate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let decoded = image::open(path)?.to_rgba8();
        let (width, height) = decoded.dimensions();
        tracing::debug!(path = %path.display(), width, height, "decoded pose image");
        Self::from_rgba(width, height, decoded.as_raw())
    }

    pub fn width(&self) -> u32 {
        self.pixmap.width()
    }

    pub fn height(&self) -> u32 {
        self.pixmap.height()
    }

    pub fn pixmap(&self) -> &Pixmap {
        &self.pixmap
    }
}

impl fmt::Debug for PoseImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoseImage")
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}

/// Registry of pose images. Populated once per generation cycle, then read
/// by the compositor every frame.
#[derive(Debug, Default, Clone)]
pub struct PoseSet {
    poses: HashMap<PoseId, PoseImage>,
}

impl PoseSet {
    pub fn new() -> Self {
        Self {
            poses: HashMap::new(),
        }
    }

    /// Loads every `(pose, path)` pair. Fails on the first undecodable file.
    pub fn load<'a, I>(paths: I) -> Result<Self>
    where
        I: IntoIterator<Item = (PoseId, &'a Path)>,
    {
        let mut set = Self::new();
        for (id, path) in paths {
            set.insert(id, PoseImage::load(path)?);
        }
        if !set.has_base() {
            tracing::warn!("pose set has no base image; frames will be skipped");
        }
        Ok(set)
    }

    pub fn insert(&mut self, id: PoseId, image: PoseImage) {
        self.poses.insert(id, image);
    }

    pub fn has_base(&self) -> bool {
        self.poses.contains_key(&PoseId::Base)
    }

    pub fn len(&self) -> usize {
        self.poses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.poses.is_empty()
    }

    /// Image for `id`, falling back to the base pose when `id` is missing.
    /// `None` only while the base pose itself is unavailable.
    pub fn resolve(&self, id: PoseId) -> Option<&PoseImage> {
        self.poses
            .get(&id)
            .or_else(|| self.poses.get(&PoseId::Base))
    }
}

use std::path::Path;

use async_trait::async_trait;
use glam::Vec2;
use image::DynamicImage;
use snafu::ResultExt;

use crate::{
    analysis::{bbox::Bbox, labels::Category},
    error::{FerrdiagError, IoReadSnafu, JsonSnafu, RecognitionError},
    layout::element::TextBlock,
};

/// A crop of the source image submitted for recognition.
#[derive(Debug, Clone)]
pub struct RegionImage {
    /// Region name used in logs and warnings.
    pub id: String,
    /// Where the crop sits in the source image.
    pub bbox: Bbox,
    pub image: DynamicImage,
}

/// What the pipeline already knows about a region.
#[derive(Debug, Clone, Default)]
pub struct RecognitionHints {
    pub category: Option<Category>,
    pub expect_formula: bool,
}

/// A text/formula recognition backend.
///
/// Block boxes are returned in region-local coordinates. Backends may be
/// remote; the text subsystem applies timeouts and retries around every call.
#[async_trait]
pub trait Recognizer: Send + Sync {
    async fn recognize(
        &self,
        region: &RegionImage,
        hints: &RecognitionHints,
    ) -> Result<Vec<TextBlock>, RecognitionError>;

    /// Converts recognized formula text to canonical markup.
    ///
    /// Backends without formula support keep the default.
    async fn to_notation(
        &self,
        _region: &RegionImage,
        _text: &str,
    ) -> Result<Option<String>, RecognitionError> {
        Ok(None)
    }
}

/// Serves a fixed set of blocks given in image coordinates.
///
/// A block is returned for every region containing its center.
#[derive(Debug, Clone, Default)]
pub struct StaticRecognizer {
    blocks: Vec<TextBlock>,
}

impl StaticRecognizer {
    pub fn new(blocks: Vec<TextBlock>) -> Self {
        Self { blocks }
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, FerrdiagError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).context(IoReadSnafu {
            path: path.display().to_string(),
        })?;
        let blocks = serde_json::from_str(&json).context(JsonSnafu { stage: "text" })?;
        Ok(Self { blocks })
    }
}

#[async_trait]
impl Recognizer for StaticRecognizer {
    async fn recognize(
        &self,
        region: &RegionImage,
        _hints: &RecognitionHints,
    ) -> Result<Vec<TextBlock>, RecognitionError> {
        let origin = region.bbox.min;
        let size = Vec2::new(region.image.width() as f32, region.image.height() as f32);

        Ok(self
            .blocks
            .iter()
            .filter(|block| region.bbox.contains_point(block.bbox.center()))
            .map(|block| {
                let mut local = block.clone();
                local.bbox = Bbox::new(block.bbox.min - origin, block.bbox.max - origin)
                    .clamp(Vec2::ZERO, size);
                local
            })
            .collect())
    }

    async fn to_notation(
        &self,
        region: &RegionImage,
        text: &str,
    ) -> Result<Option<String>, RecognitionError> {
        Ok(self
            .blocks
            .iter()
            .filter(|block| region.bbox.contains_point(block.bbox.center()) && block.text == text)
            .find_map(|block| block.notation.clone()))
    }
}

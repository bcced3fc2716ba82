use std::path::Path;

use async_trait::async_trait;
use glam::Vec2;
use image::DynamicImage;
use serde::Deserialize;
use snafu::{ResultExt, ensure};

use crate::{
    analysis::{bbox::Bbox, mask::Mask},
    error::{FerrdiagError, IoReadSnafu, JsonSnafu, ModelUnavailableSnafu},
};

/// One region reported by the segmentation model.
#[derive(Debug, Clone)]
pub struct RawRegion {
    pub label: String,
    pub score: f32,
    /// Full-image mask of the region.
    pub mask: Option<Mask>,
    /// Box reported alongside or instead of the mask.
    pub bbox: Option<Bbox>,
}

/// Raw output of a segmentation model over one image.
#[derive(Debug, Clone, Default)]
pub struct SegmentationOutput {
    pub width: u32,
    pub height: u32,
    pub regions: Vec<RawRegion>,
}

/// The segmentation model, seen from the pipeline.
///
/// Implementations own inference entirely; the pipeline only consumes the
/// masks, labels and scores they return.
#[async_trait]
pub trait SegmentationModel: Send + Sync {
    fn name(&self) -> &str;

    async fn segment(&self, image: &DynamicImage) -> Result<SegmentationOutput, FerrdiagError>;
}

#[derive(Debug, Clone, Deserialize)]
struct JsonRegion {
    label: String,
    score: f32,
    #[serde(default)]
    polygon: Option<Vec<[f32; 2]>>,
    /// `[x1, y1, x2, y2]`
    #[serde(default, rename = "box")]
    corners: Option<[f32; 4]>,
}

#[derive(Debug, Clone, Deserialize)]
struct JsonOutput {
    regions: Vec<JsonRegion>,
}

/// Replays segmentation output saved as JSON.
///
/// ```json
/// {"regions": [
///   {"label": "rounded rectangle", "score": 0.93,
///    "polygon": [[10, 10], [90, 10], [90, 50], [10, 50]]},
///   {"label": "arrow", "score": 0.81, "box": [90, 25, 140, 35]}
/// ]}
/// ```
///
/// Polygons are rasterized at the size of the image being segmented.
#[derive(Debug, Clone)]
pub struct JsonSegmentation {
    regions: Vec<JsonRegion>,
}

impl JsonSegmentation {
    pub fn from_json(json: &str) -> Result<Self, FerrdiagError> {
        let output: JsonOutput = serde_json::from_str(json).context(JsonSnafu {
            stage: "segmentation",
        })?;
        Ok(Self {
            regions: output.regions,
        })
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, FerrdiagError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).context(IoReadSnafu {
            path: path.display().to_string(),
        })?;
        Self::from_json(&json)
    }
}

#[async_trait]
impl SegmentationModel for JsonSegmentation {
    fn name(&self) -> &str {
        "json"
    }

    async fn segment(&self, image: &DynamicImage) -> Result<SegmentationOutput, FerrdiagError> {
        let (width, height) = (image.width(), image.height());
        let mut regions = Vec::with_capacity(self.regions.len());

        for (index, region) in self.regions.iter().enumerate() {
            let mask = region.polygon.as_ref().map(|polygon| {
                let points: Vec<Vec2> = polygon.iter().map(|[x, y]| Vec2::new(*x, *y)).collect();
                Mask::from_polygon(width, height, &points)
            });
            let bbox = region
                .corners
                .map(|[x1, y1, x2, y2]| Bbox::new(Vec2::new(x1, y1), Vec2::new(x2, y2)));
            ensure!(
                mask.is_some() || bbox.is_some(),
                ModelUnavailableSnafu {
                    message: format!("region {index} has neither polygon nor box"),
                }
            );

            regions.push(RawRegion {
                label: region.label.clone(),
                score: region.score,
                mask,
                bbox,
            });
        }

        Ok(SegmentationOutput {
            width,
            height,
            regions,
        })
    }
}

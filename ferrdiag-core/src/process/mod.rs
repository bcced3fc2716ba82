//! Per-category refinement of extracted elements.
//!
//! Every category is routed by an exhaustive match, so adding a category
//! forces a routing decision at compile time.

pub mod arrow;
pub mod icon;
pub mod shape;

use image::{DynamicImage, GenericImageView, Rgba};
use rayon::prelude::*;
use tracing::*;

use crate::{
    analysis::{bbox::Bbox, labels::Category},
    config::ReconstructConfig,
    error::{FerrdiagError, Warning},
    layout::element::Element,
};

pub use arrow::ArrowProcessor;
pub use icon::IconPictureProcessor;
pub use shape::ShapeProcessor;

/// An element an arrow endpoint may attach to.
#[derive(Debug, Clone, PartialEq)]
pub struct Anchor {
    pub id: String,
    pub bbox: Bbox,
}

impl Anchor {
    /// Anchor candidates among `elements`, in input order.
    pub fn collect(elements: &[Element]) -> Vec<Anchor> {
        elements
            .iter()
            .filter(|element| element.category.is_anchor())
            .map(|element| Anchor {
                id: element.id.clone(),
                bbox: element.bbox,
            })
            .collect()
    }
}

/// Read-only state shared by all processors during one dispatch.
#[derive(Debug, Clone, Copy)]
pub struct Scene<'a> {
    pub image: &'a DynamicImage,
    pub anchors: &'a [Anchor],
}

pub trait CategoryProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    fn accepts(&self, category: Category) -> bool;

    /// Returns the refined element, or an error when the element cannot be
    /// refined. Errors degrade the element, they never abort a run.
    fn refine(&self, element: &Element, scene: &Scene) -> Result<Element, FerrdiagError>;
}

pub enum Route<'a> {
    Processor(&'a dyn CategoryProcessor),
    /// Handled by the text recognition subsystem.
    Text,
    Passthrough,
}

/// The three category processors plus the degradation policy.
#[derive(Debug, Clone)]
pub struct Processors {
    icon: IconPictureProcessor,
    shape: ShapeProcessor,
    arrow: ArrowProcessor,
    penalty: f32,
}

impl Processors {
    pub fn from_config(config: &ReconstructConfig) -> Self {
        Self {
            icon: IconPictureProcessor::new(config.upscale_min_side),
            shape: ShapeProcessor,
            arrow: ArrowProcessor::new(config.arrow_tolerance),
            penalty: config.degraded_penalty,
        }
    }

    pub fn route(&self, category: Category) -> Route<'_> {
        match category {
            Category::Icon | Category::Picture => Route::Processor(&self.icon),
            Category::Shape => Route::Processor(&self.shape),
            Category::Arrow => Route::Processor(&self.arrow),
            Category::Text | Category::Formula => Route::Text,
            Category::Background => Route::Passthrough,
        }
    }

    /// Refines `elements` in parallel, preserving their order.
    #[tracing::instrument(skip_all)]
    pub fn refine_all(
        &self,
        elements: Vec<Element>,
        image: &DynamicImage,
        anchors: &[Anchor],
    ) -> (Vec<Element>, Vec<Warning>) {
        let scene = Scene { image, anchors };

        let results: Vec<(Element, Option<Warning>)> = elements
            .into_par_iter()
            .map(|element| self.refine_one(element, &scene))
            .collect();

        let mut refined = Vec::with_capacity(results.len());
        let mut warnings = Vec::new();
        for (element, warning) in results {
            refined.push(element);
            warnings.extend(warning);
        }

        debug!(
            "Refined {} elements, {} degraded",
            refined.len(),
            warnings.len()
        );
        (refined, warnings)
    }

    fn refine_one(&self, element: Element, scene: &Scene) -> (Element, Option<Warning>) {
        let processor = match self.route(element.category) {
            Route::Processor(processor) => processor,
            Route::Text | Route::Passthrough => return (element, None),
        };
        debug_assert!(processor.accepts(element.category));

        match processor.refine(&element, scene) {
            Ok(mut refined) => {
                refined.search = None;
                (refined, None)
            }
            Err(err) => {
                warn!(
                    "{} degraded element {}: {}",
                    processor.name(),
                    element.id,
                    err
                );
                let warning = Warning::ElementRefinementDegraded {
                    id: element.id.clone(),
                    processor: processor.name().to_string(),
                    message: err.to_string(),
                };
                let mut degraded = element;
                degraded.search = None;
                degraded.degrade(self.penalty);
                (degraded, Some(warning))
            }
        }
    }
}

/// Integer pixel rectangle `(x, y, width, height)` covering `bbox` within the image.
pub(crate) fn pixel_rect(bbox: &Bbox, image: &DynamicImage) -> (u32, u32, u32, u32) {
    let (width, height) = image.dimensions();
    let x0 = (bbox.min.x.floor().max(0.0) as u32).min(width);
    let y0 = (bbox.min.y.floor().max(0.0) as u32).min(height);
    let x1 = (bbox.max.x.ceil().max(0.0) as u32).min(width);
    let y1 = (bbox.max.y.ceil().max(0.0) as u32).min(height);
    (x0, y0, x1.saturating_sub(x0), y1.saturating_sub(y0))
}

/// Per-channel median of the given pixels, `None` when there are none.
///
/// The median ignores labels and strokes drawn over a fill as long as they
/// cover less than half of the sampled area.
pub(crate) fn median_color(pixels: impl Iterator<Item = Rgba<u8>>) -> Option<[u8; 3]> {
    let mut channels: [Vec<u8>; 3] = Default::default();
    for pixel in pixels {
        for (channel, value) in channels.iter_mut().zip(pixel.0) {
            channel.push(value);
        }
    }
    if channels[0].is_empty() {
        return None;
    }

    let mut color = [0u8; 3];
    for (out, channel) in color.iter_mut().zip(channels.iter_mut()) {
        channel.sort_unstable();
        *out = channel[channel.len() / 2];
    }
    Some(color)
}

pub(crate) fn hex_color(color: [u8; 3]) -> String {
    format!("#{:02X}{:02X}{:02X}", color[0], color[1], color[2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::mask::Mask;
    use std::sync::Arc;

    fn processors() -> Processors {
        Processors::from_config(&ReconstructConfig::default())
    }

    #[test]
    fn test_route_is_exhaustive_and_consistent() {
        let processors = processors();
        for category in Category::ALL {
            match processors.route(category) {
                Route::Processor(processor) => assert!(processor.accepts(category)),
                Route::Text => assert!(category.is_textual()),
                Route::Passthrough => assert_eq!(category, Category::Background),
            }
        }
    }

    #[test]
    fn test_each_category_has_one_processor() {
        let processors = processors();
        let all: [&dyn CategoryProcessor; 3] =
            [&processors.icon, &processors.shape, &processors.arrow];
        for category in Category::ALL {
            let accepting = all.iter().filter(|p| p.accepts(category)).count();
            let expected = usize::from(!category.is_textual() && category != Category::Background);
            assert_eq!(accepting, expected, "{category}");
        }
    }

    #[test]
    fn test_degenerate_element_degrades_with_penalty() {
        let processors = processors();
        let image = DynamicImage::new_rgb8(100, 100);
        // A shape whose mask is empty cannot be classified
        let mut element = Element::new(
            "element_0000",
            Category::Shape,
            Bbox::from_xywh(10.0, 10.0, 30.0, 30.0),
            0.9,
        );
        element.mask = Some(Arc::new(Mask::new(image::GrayImage::new(100, 100))));

        let (refined, warnings) = processors.refine_all(vec![element], &image, &[]);
        assert_eq!(warnings.len(), 1);
        assert!(matches!(
            &warnings[0],
            Warning::ElementRefinementDegraded { id, .. } if id == "element_0000"
        ));
        assert!((refined[0].confidence - 0.7).abs() < 1e-6);
        assert!(refined[0].is_degraded());
        assert_eq!(refined[0].bbox, Bbox::from_xywh(10.0, 10.0, 30.0, 30.0));
    }

    #[test]
    fn test_text_and_background_pass_through() {
        let processors = processors();
        let image = DynamicImage::new_rgb8(50, 50);
        let text = Element::new(
            "element_0000",
            Category::Text,
            Bbox::from_xywh(0.0, 0.0, 20.0, 10.0),
            0.8,
        );
        let background = Element::new(
            "element_0001",
            Category::Background,
            Bbox::from_xywh(0.0, 0.0, 50.0, 50.0),
            0.6,
        );

        let (refined, warnings) =
            processors.refine_all(vec![text.clone(), background.clone()], &image, &[]);
        assert!(warnings.is_empty());
        assert_eq!(refined, vec![text, background]);
    }

    #[test]
    fn test_median_color() {
        let pixels = [
            Rgba([10, 20, 30, 255]),
            Rgba([200, 200, 200, 255]),
            Rgba([10, 20, 30, 255]),
        ];
        assert_eq!(median_color(pixels.into_iter()), Some([10, 20, 30]));
        assert_eq!(median_color(std::iter::empty()), None);
        assert_eq!(hex_color([255, 16, 0]), "#FF1000");
    }

    #[test]
    fn test_pixel_rect_clamps() {
        let image = DynamicImage::new_rgb8(40, 30);
        let rect = pixel_rect(&Bbox::from_xywh(30.5, 20.2, 20.0, 20.0), &image);
        assert_eq!(rect, (30, 20, 10, 10));
    }
}

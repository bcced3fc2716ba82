use std::sync::Arc;

use image::DynamicImage;
use snafu::{OptionExt, ensure};
use tracing::*;

use crate::{
    analysis::labels::Category,
    config::ReconstructConfig,
    consts::GROUP_CONTAINMENT_RATIO,
    error::{FerrdiagError, InvalidInputSnafu, ModelUnavailableSnafu},
    inference::model::SegmentationOutput,
    layout::element::Element,
};

/// Elements extracted from one image, with the image they came from.
#[derive(Debug, Clone)]
pub struct SegmentationResult {
    pub elements: Vec<Element>,
    pub image: Arc<DynamicImage>,
}

/// Rejects images the pipeline cannot work on.
pub fn validate_image(image: &DynamicImage) -> Result<(), FerrdiagError> {
    ensure!(
        image.width() > 0 && image.height() > 0,
        InvalidInputSnafu {
            stage: "init",
            message: format!("image is empty ({}x{})", image.width(), image.height()),
        }
    );
    Ok(())
}

/// Turns raw segmentation output into canonical elements.
#[derive(Debug, Clone)]
pub struct SegmentationExtractor {
    min_confidence: f32,
    min_mask_area: u32,
}

impl SegmentationExtractor {
    pub fn new(min_confidence: f32, min_mask_area: u32) -> Self {
        Self {
            min_confidence,
            min_mask_area,
        }
    }

    pub fn from_config(config: &ReconstructConfig) -> Self {
        Self::new(config.min_element_confidence, config.min_mask_area)
    }

    #[tracing::instrument(skip_all)]
    pub fn extract(
        &self,
        image: Arc<DynamicImage>,
        output: Option<&SegmentationOutput>,
    ) -> Result<SegmentationResult, FerrdiagError> {
        validate_image(&image)?;
        let output = output.context(ModelUnavailableSnafu {
            message: "no segmentation output",
        })?;

        let (width, height) = (image.width(), image.height());
        ensure!(
            output.width == width && output.height == height,
            ModelUnavailableSnafu {
                message: format!(
                    "output covers {}x{} but image is {}x{}",
                    output.width, output.height, width, height
                ),
            }
        );

        let mut elements = Vec::with_capacity(output.regions.len());
        for (index, region) in output.regions.iter().enumerate() {
            ensure!(
                !region.label.trim().is_empty(),
                ModelUnavailableSnafu {
                    message: format!("region {index} has no label"),
                }
            );
            ensure!(
                region.score.is_finite() && (0.0..=1.0).contains(&region.score),
                ModelUnavailableSnafu {
                    message: format!("region {index} has invalid score {}", region.score),
                }
            );
            ensure!(
                region.mask.is_some() || region.bbox.is_some(),
                ModelUnavailableSnafu {
                    message: format!("region {index} has neither mask nor box"),
                }
            );

            if region.score < self.min_confidence {
                debug!(
                    "Drop region {} `{}` with score {:.3}",
                    index, region.label, region.score
                );
                continue;
            }

            let mut mask_area = None;
            let extent = match &region.mask {
                Some(mask) => {
                    ensure!(
                        mask.dimensions() == (width, height),
                        ModelUnavailableSnafu {
                            message: format!(
                                "mask of region {index} is {:?}, expected {:?}",
                                mask.dimensions(),
                                (width, height)
                            ),
                        }
                    );
                    let area = mask.area();
                    if area < self.min_mask_area {
                        debug!("Drop region {} with mask area {}", index, area);
                        continue;
                    }
                    mask_area = Some(area);
                    mask.extent()
                }
                None => region.bbox,
            };

            let Some(bbox) = extent.and_then(|bbox| bbox.clamped(width, height)) else {
                debug!("Drop region {} with empty extent", index);
                continue;
            };

            let category = Category::from_label(&region.label);
            let mut element = Element::new(
                format!("element_{:04}", elements.len()),
                category,
                bbox,
                region.score,
            );
            element.order = elements.len();
            element.style.set("label", region.label.trim());
            if let Some(area) = mask_area {
                element.style.set("maskArea", area.to_string());
            }
            element.mask = region.mask.clone().map(Arc::new);
            elements.push(element);
        }

        group_by_containment(&mut elements);

        info!(
            "Extracted {} elements from {} regions",
            elements.len(),
            output.regions.len()
        );

        Ok(SegmentationResult { elements, image })
    }
}

/// Places every element under the smallest shape or picture that contains it.
fn group_by_containment(elements: &mut [Element]) {
    let mut links = Vec::new();

    for (index, element) in elements.iter().enumerate() {
        let container = elements
            .iter()
            .enumerate()
            .filter(|(other_index, other)| {
                *other_index != index
                    && matches!(other.category, Category::Shape | Category::Picture)
                    && other.bbox.area() > element.bbox.area()
                    && element.bbox.intersection(&other.bbox)
                        >= GROUP_CONTAINMENT_RATIO * element.bbox.area()
            })
            .min_by(|(_, a), (_, b)| a.bbox.area().total_cmp(&b.bbox.area()))
            .map(|(container_index, _)| container_index);

        if let Some(container_index) = container {
            links.push((index, container_index));
        }
    }

    for (member, container) in links {
        let container_id = elements[container].id.clone();
        let member_id = elements[member].id.clone();
        elements[member].parent = Some(container_id);
        elements[container].children.push(member_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analysis::{bbox::Bbox, mask::Mask},
        inference::model::RawRegion,
    };

    fn region(label: &str, score: f32, bbox: Bbox) -> RawRegion {
        RawRegion {
            label: label.into(),
            score,
            mask: Some(Mask::from_bbox(200, 100, &bbox)),
            bbox: None,
        }
    }

    fn output(regions: Vec<RawRegion>) -> SegmentationOutput {
        SegmentationOutput {
            width: 200,
            height: 100,
            regions,
        }
    }

    fn image() -> Arc<DynamicImage> {
        Arc::new(DynamicImage::new_rgb8(200, 100))
    }

    #[test]
    fn test_extract_elements_from_masks() {
        let extractor = SegmentationExtractor::new(0.5, 100);
        let output = output(vec![
            region("rectangle", 0.92, Bbox::from_xywh(10.0, 10.0, 60.0, 30.0)),
            region("arrow", 0.75, Bbox::from_xywh(70.0, 22.0, 50.0, 6.0)),
            region("text", 0.3, Bbox::from_xywh(20.0, 15.0, 40.0, 10.0)),
        ]);

        let result = extractor.extract(image(), Some(&output)).unwrap();
        // The 0.3 text region falls below the floor
        assert_eq!(result.elements.len(), 2);

        let shape = &result.elements[0];
        assert_eq!(shape.id, "element_0000");
        assert_eq!(shape.category, Category::Shape);
        assert_eq!(shape.bbox, Bbox::from_xywh(10.0, 10.0, 60.0, 30.0));
        assert_eq!(shape.confidence, 0.92);
        assert_eq!(shape.style.get("maskArea"), Some("1800")); // 60 * 30
        assert!(shape.mask.is_some());

        let arrow = &result.elements[1];
        assert_eq!(arrow.id, "element_0001");
        assert_eq!(arrow.order, 1);
        assert_eq!(arrow.category, Category::Arrow);
        assert_eq!(arrow.confidence, 0.75);
    }

    #[test]
    fn test_small_masks_dropped() {
        let extractor = SegmentationExtractor::new(0.5, 100);
        // 9x9 = 81 pixels
        let output = output(vec![region("icon", 0.9, Bbox::from_xywh(5.0, 5.0, 9.0, 9.0))]);
        let result = extractor.extract(image(), Some(&output)).unwrap();
        assert!(result.elements.is_empty());
    }

    #[test]
    fn test_box_only_region_is_clamped() {
        let extractor = SegmentationExtractor::new(0.5, 100);
        let output = output(vec![RawRegion {
            label: "photo".into(),
            score: 0.8,
            mask: None,
            bbox: Some(Bbox::from_xywh(150.0, 50.0, 100.0, 100.0)),
        }]);
        let result = extractor.extract(image(), Some(&output)).unwrap();
        assert_eq!(result.elements[0].category, Category::Picture);
        assert_eq!(result.elements[0].bbox, Bbox::from_xywh(150.0, 50.0, 50.0, 50.0));
    }

    #[test]
    fn test_containment_grouping() {
        let extractor = SegmentationExtractor::new(0.5, 100);
        let output = output(vec![
            region("container", 0.9, Bbox::from_xywh(0.0, 0.0, 150.0, 90.0)),
            region("box", 0.9, Bbox::from_xywh(10.0, 10.0, 60.0, 30.0)),
            region("icon", 0.9, Bbox::from_xywh(20.0, 15.0, 20.0, 20.0)),
        ]);
        let result = extractor.extract(image(), Some(&output)).unwrap();
        let [container, inner, icon] = &result.elements[..] else {
            panic!("expected three elements");
        };
        assert_eq!(container.children, vec!["element_0001".to_string()]);
        assert_eq!(inner.parent.as_deref(), Some("element_0000"));
        // The icon belongs to the smallest enclosing shape
        assert_eq!(icon.parent.as_deref(), Some("element_0001"));
        assert_eq!(inner.children, vec!["element_0002".to_string()]);
    }

    #[test]
    fn test_empty_image_is_invalid_input() {
        let extractor = SegmentationExtractor::new(0.5, 100);
        let empty = Arc::new(DynamicImage::new_rgb8(0, 0));
        let result = extractor.extract(empty, Some(&output(vec![])));
        assert!(matches!(result, Err(FerrdiagError::InvalidInput { .. })));
    }

    #[test]
    fn test_missing_or_malformed_output() {
        let extractor = SegmentationExtractor::new(0.5, 100);
        assert!(matches!(
            extractor.extract(image(), None),
            Err(FerrdiagError::ModelUnavailable { .. })
        ));

        let unlabeled = output(vec![region(" ", 0.9, Bbox::from_xywh(0.0, 0.0, 20.0, 20.0))]);
        assert!(matches!(
            extractor.extract(image(), Some(&unlabeled)),
            Err(FerrdiagError::ModelUnavailable { .. })
        ));

        let mut wrong_size = output(vec![]);
        wrong_size.regions.push(RawRegion {
            label: "box".into(),
            score: 0.9,
            mask: Some(Mask::from_bbox(20, 20, &Bbox::from_xywh(0.0, 0.0, 15.0, 15.0))),
            bbox: None,
        });
        assert!(matches!(
            extractor.extract(image(), Some(&wrong_size)),
            Err(FerrdiagError::ModelUnavailable { .. })
        ));
    }

    #[test]
    fn test_no_regions_gives_no_elements() {
        let extractor = SegmentationExtractor::new(0.5, 100);
        let result = extractor.extract(image(), Some(&output(vec![]))).unwrap();
        assert!(result.elements.is_empty());
    }
}

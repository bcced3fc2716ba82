//! Concurrent text and formula recognition over candidate regions.
//!
//! Every recognizer call is bounded by a semaphore and a timeout and is
//! retried with exponential backoff. A region that never succeeds yields a
//! warning instead of failing the run.

pub mod formula;

use std::{
    sync::{Arc, LazyLock},
    time::Duration,
};

use futures::future;
use glam::Vec2;
use image::DynamicImage;
use regex::Regex;
use tokio::{sync::Semaphore, time};
use tracing::*;

use crate::{
    analysis::{bbox::Bbox, labels::Category},
    config::ReconstructConfig,
    error::{RecognitionError, Warning},
    inference::recognizer::{RecognitionHints, Recognizer, RegionImage},
    layout::element::{Element, TextBlock},
    process::pixel_rect,
};

pub(crate) static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("Invalid whitespace regex"));

static WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\w").expect("Invalid word regex"));

/// Region id used when no text element was extracted and the whole image is
/// searched instead.
pub const FULL_IMAGE_REGION: &str = "image";

/// A part of the image submitted for recognition.
#[derive(Debug, Clone, PartialEq)]
pub struct TextRegion {
    pub id: String,
    pub bbox: Bbox,
    pub category: Option<Category>,
}

impl TextRegion {
    /// Text and formula elements, or the whole image when elements were
    /// found but none of them is textual. Nothing at all when no element was
    /// found.
    pub fn collect(elements: &[Element], width: u32, height: u32) -> Vec<TextRegion> {
        if elements.is_empty() {
            return Vec::new();
        }
        let regions: Vec<TextRegion> = elements
            .iter()
            .filter(|element| element.category.is_textual())
            .map(|element| TextRegion {
                id: element.id.clone(),
                bbox: element.bbox,
                category: Some(element.category),
            })
            .collect();

        if regions.is_empty() {
            vec![TextRegion {
                id: FULL_IMAGE_REGION.to_string(),
                bbox: Bbox::from_xywh(0.0, 0.0, width as f32, height as f32),
                category: None,
            }]
        } else {
            regions
        }
    }

    fn hints(&self) -> RecognitionHints {
        RecognitionHints {
            category: self.category,
            expect_formula: self.category == Some(Category::Formula),
        }
    }

    fn crop(&self, image: &DynamicImage) -> Option<RegionImage> {
        let (x, y, width, height) = pixel_rect(&self.bbox, image);
        (width > 0 && height > 0).then(|| RegionImage {
            id: self.id.clone(),
            bbox: Bbox::from_xywh(x as f32, y as f32, width as f32, height as f32),
            image: image.crop_imm(x, y, width, height),
        })
    }
}

/// Blocks and warnings of one recognition pass.
#[derive(Debug, Clone, Default)]
pub struct TextOutput {
    pub blocks: Vec<TextBlock>,
    pub warnings: Vec<Warning>,
}

enum Failure {
    Timeout,
    Recognizer(RecognitionError),
}

/// Drives a [`Recognizer`] over regions of one image.
pub struct TextRecognition {
    recognizer: Arc<dyn Recognizer>,
    batch_size: usize,
    max_in_flight: usize,
    timeout: Duration,
    max_attempts: usize,
    backoff: Duration,
    fix_text: bool,
}

impl TextRecognition {
    pub fn new(recognizer: Arc<dyn Recognizer>, config: &ReconstructConfig) -> Self {
        Self {
            recognizer,
            batch_size: config.recognition_batch_size.max(1),
            max_in_flight: config.recognition_max_in_flight.max(1),
            timeout: config.recognition_timeout(),
            max_attempts: config.recognition_max_attempts.max(1),
            backoff: config.recognition_backoff(),
            fix_text: config.trim_control_chars,
        }
    }

    /// Recognizes all `regions`, dropping blocks below `floor`.
    ///
    /// Blocks come back in image coordinates, tagged with their region id,
    /// but neither deduplicated nor ordered; see [`arrange`].
    #[tracing::instrument(skip_all)]
    pub async fn recognize(
        &self,
        image: &DynamicImage,
        regions: &[TextRegion],
        floor: f32,
    ) -> TextOutput {
        let semaphore = Semaphore::new(self.max_in_flight);
        let size = Vec2::new(image.width() as f32, image.height() as f32);
        let mut output = TextOutput::default();

        // Crops of one batch are alive at the same time, not more
        for batch in regions.chunks(self.batch_size) {
            let crops: Vec<(&TextRegion, RegionImage)> = batch
                .iter()
                .filter_map(|region| match region.crop(image) {
                    Some(crop) => Some((region, crop)),
                    None => {
                        debug!("Skip empty text region {}", region.id);
                        None
                    }
                })
                .collect();

            let tasks = crops
                .iter()
                .map(|(region, crop)| {
                    self.recognize_region(region, crop, size, floor, &semaphore)
                        .instrument(info_span!("recognize", region = %region.id))
                })
                .collect::<Vec<_>>();

            for result in future::join_all(tasks).in_current_span().await {
                match result {
                    Ok(blocks) => output.blocks.extend(blocks),
                    Err(warning) => output.warnings.push(warning),
                }
            }
        }

        debug!(
            "Recognized {} blocks in {} regions, {} failed",
            output.blocks.len(),
            regions.len(),
            output.warnings.len()
        );
        output
    }

    async fn recognize_region(
        &self,
        region: &TextRegion,
        crop: &RegionImage,
        size: Vec2,
        floor: f32,
        semaphore: &Semaphore,
    ) -> Result<Vec<TextBlock>, Warning> {
        let raw = self.call_with_retry(crop, &region.hints(), semaphore).await?;

        let mut blocks = Vec::with_capacity(raw.len());
        for block in raw {
            let Some(mut block) = self.clean_block(block, region, crop, size, floor) else {
                continue;
            };
            if block.is_formula {
                block.notation = self.notation(crop, &block, semaphore).await;
            }
            blocks.push(block);
        }
        Ok(blocks)
    }

    async fn call_with_retry(
        &self,
        crop: &RegionImage,
        hints: &RecognitionHints,
        semaphore: &Semaphore,
    ) -> Result<Vec<TextBlock>, Warning> {
        let attempts = self.max_attempts;
        let mut last = Failure::Timeout;

        for attempt in 1..=attempts {
            let outcome = {
                let Ok(_permit) = semaphore.acquire().await else {
                    return Err(Warning::RecognitionFailure {
                        region: crop.id.clone(),
                        attempts: attempt - 1,
                        message: "recognizer pool closed".to_string(),
                    });
                };
                time::timeout(self.timeout, self.recognizer.recognize(crop, hints)).await
            };

            match outcome {
                Ok(Ok(blocks)) => return Ok(blocks),
                Ok(Err(err)) => {
                    warn!(
                        "Recognize {} attempt {}/{} failed: {}",
                        crop.id, attempt, attempts, err
                    );
                    last = Failure::Recognizer(err);
                }
                Err(_) => {
                    warn!(
                        "Recognize {} attempt {}/{} timed out after {:?}",
                        crop.id, attempt, attempts, self.timeout
                    );
                    last = Failure::Timeout;
                }
            }

            if attempt < attempts {
                let factor = 1u32 << (attempt - 1).min(16) as u32;
                time::sleep(self.backoff.saturating_mul(factor)).await;
            }
        }

        Err(match last {
            Failure::Timeout => Warning::RecognitionTimeout {
                region: crop.id.clone(),
                attempts,
            },
            Failure::Recognizer(err) => Warning::RecognitionFailure {
                region: crop.id.clone(),
                attempts,
                message: err.to_string(),
            },
        })
    }

    fn clean_block(
        &self,
        mut block: TextBlock,
        region: &TextRegion,
        crop: &RegionImage,
        size: Vec2,
        floor: f32,
    ) -> Option<TextBlock> {
        block.text = clean_text(&block.text, self.fix_text);
        // NaN confidences fail the comparison and are dropped too
        if !WORD.is_match(&block.text) || !(block.confidence >= floor) {
            return None;
        }
        block.confidence = block.confidence.min(1.0);

        let origin = crop.bbox.min;
        let translated = Bbox::new(block.bbox.min + origin, block.bbox.max + origin)
            .clamp(Vec2::ZERO, size);
        block.bbox = if block.bbox.is_valid() && translated.is_valid() {
            translated
        } else {
            crop.bbox
        };

        block.is_formula = block.is_formula
            || region.category == Some(Category::Formula)
            || formula::looks_like_formula(&block.text);
        block.source = Some(region.id.clone());
        Some(block)
    }

    /// Notation for a formula block. Falls back to the recognizer's own
    /// notation, then to the text, when conversion is unavailable.
    async fn notation(
        &self,
        crop: &RegionImage,
        block: &TextBlock,
        semaphore: &Semaphore,
    ) -> Option<String> {
        let converted = match semaphore.acquire().await {
            Ok(_permit) => {
                match time::timeout(self.timeout, self.recognizer.to_notation(crop, &block.text))
                    .await
                {
                    Ok(Ok(notation)) => notation,
                    Ok(Err(err)) => {
                        warn!("Notation for {} failed: {}", crop.id, err);
                        None
                    }
                    Err(_) => {
                        warn!("Notation for {} timed out", crop.id);
                        None
                    }
                }
            }
            Err(_) => None,
        };

        let raw = converted
            .or_else(|| block.notation.clone())
            .unwrap_or_else(|| block.text.clone());
        formula::normalize_notation(&raw)
    }
}

/// Repairs mojibake when `fix` is set, then strips control characters and
/// collapses whitespace.
pub fn clean_text(text: &str, fix: bool) -> String {
    let fixed = if fix {
        plsfix::fix_text(text, None)
    } else {
        text.to_string()
    };
    let printable: String = fixed
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    WHITESPACE.replace_all(printable.trim(), " ").into_owned()
}

/// Deduplicates blocks, puts them in reading order and assigns their ids.
///
/// Of two blocks with IoU above `dedup_iou` the more confident one stays,
/// the earlier one on ties.
pub fn arrange(blocks: Vec<TextBlock>, dedup_iou: f32) -> Vec<TextBlock> {
    let mut kept: Vec<TextBlock> = Vec::with_capacity(blocks.len());
    for block in blocks {
        match kept
            .iter_mut()
            .find(|existing| existing.bbox.iou(&block.bbox) > dedup_iou)
        {
            Some(existing) => {
                if block.confidence > existing.confidence {
                    *existing = block;
                }
            }
            None => kept.push(block),
        }
    }

    let mut ordered = reading_order(kept);
    for (index, block) in ordered.iter_mut().enumerate() {
        block.id = format!("text_{index:04}");
    }
    ordered
}

/// Row bands top to bottom, left to right within a band.
///
/// A band holds blocks whose vertical center lies within half the median
/// block height of the band's first block.
fn reading_order(mut blocks: Vec<TextBlock>) -> Vec<TextBlock> {
    if blocks.is_empty() {
        return blocks;
    }

    let mut heights: Vec<f32> = blocks.iter().map(|block| block.bbox.height()).collect();
    heights.sort_by(f32::total_cmp);
    let tolerance = heights[heights.len() / 2] / 2.0;

    blocks.sort_by(|a, b| {
        a.bbox
            .center()
            .y
            .total_cmp(&b.bbox.center().y)
            .then(a.bbox.min.x.total_cmp(&b.bbox.min.x))
    });

    let mut ordered = Vec::with_capacity(blocks.len());
    let mut band: Vec<TextBlock> = Vec::new();
    let mut band_top = 0.0;
    for block in blocks {
        let center = block.bbox.center().y;
        if !band.is_empty() && center - band_top > tolerance {
            band.sort_by(|a, b| a.bbox.min.x.total_cmp(&b.bbox.min.x));
            ordered.append(&mut band);
        }
        if band.is_empty() {
            band_top = center;
        }
        band.push(block);
    }
    band.sort_by(|a, b| a.bbox.min.x.total_cmp(&b.bbox.min.x));
    ordered.append(&mut band);
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ReconstructConfigBuilder, inference::recognizer::StaticRecognizer};
    use async_trait::async_trait;
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicUsize, Ordering},
    };

    fn config() -> ReconstructConfig {
        ReconstructConfigBuilder::default()
            .recognition_timeout_ms(100u64)
            .recognition_backoff_ms(1u64)
            .recognition_max_attempts(2usize)
            .build()
            .unwrap()
    }

    fn region(id: &str, bbox: Bbox, category: Category) -> TextRegion {
        TextRegion {
            id: id.into(),
            bbox,
            category: Some(category),
        }
    }

    /// Answers per region id; ids listed in `hang` never answer, ids in
    /// `fail` error out.
    #[derive(Default)]
    struct ScriptedRecognizer {
        answers: HashMap<String, Vec<TextBlock>>,
        hang: Vec<String>,
        fail: Vec<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Recognizer for ScriptedRecognizer {
        async fn recognize(
            &self,
            region: &RegionImage,
            _hints: &RecognitionHints,
        ) -> Result<Vec<TextBlock>, RecognitionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang.contains(&region.id) {
                std::future::pending::<()>().await;
            }
            if self.fail.contains(&region.id) {
                return Err(RecognitionError::Backend {
                    message: "service unavailable".into(),
                });
            }
            Ok(self.answers.get(&region.id).cloned().unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn test_timeout_is_isolated_to_its_region() {
        let mut recognizer = ScriptedRecognizer::default();
        recognizer.answers.insert(
            "element_0000".into(),
            vec![TextBlock::new("Start", Bbox::from_xywh(2.0, 2.0, 30.0, 10.0), 0.9)],
        );
        recognizer.hang.push("element_0001".into());
        let recognizer = Arc::new(recognizer);

        let image = DynamicImage::new_rgb8(200, 100);
        let regions = vec![
            region("element_0000", Bbox::from_xywh(10.0, 10.0, 50.0, 20.0), Category::Text),
            region("element_0001", Bbox::from_xywh(100.0, 10.0, 50.0, 20.0), Category::Text),
        ];

        let text = TextRecognition::new(recognizer.clone(), &config());
        let output = text.recognize(&image, &regions, 0.6).await;

        assert_eq!(output.blocks.len(), 1);
        assert_eq!(output.blocks[0].text, "Start");
        // Local (2, 2) inside a crop at (10, 10)
        assert_eq!(output.blocks[0].bbox, Bbox::from_xywh(12.0, 12.0, 30.0, 10.0));
        assert_eq!(output.blocks[0].source.as_deref(), Some("element_0000"));
        assert_eq!(
            output.warnings,
            vec![Warning::RecognitionTimeout {
                region: "element_0001".into(),
                attempts: 2
            }]
        );
        // One call for the healthy region, two for the hanging one
        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_backend_errors_become_failures() {
        let mut recognizer = ScriptedRecognizer::default();
        recognizer.fail.push("element_0000".into());
        let text = TextRecognition::new(Arc::new(recognizer), &config());

        let image = DynamicImage::new_rgb8(100, 100);
        let regions = vec![region(
            "element_0000",
            Bbox::from_xywh(0.0, 0.0, 50.0, 50.0),
            Category::Text,
        )];
        let output = text.recognize(&image, &regions, 0.6).await;

        assert!(output.blocks.is_empty());
        assert!(matches!(
            &output.warnings[..],
            [Warning::RecognitionFailure { region, attempts: 2, message }]
                if region == "element_0000" && message.contains("service unavailable")
        ));
    }

    #[tokio::test]
    async fn test_blocks_are_cleaned_and_filtered() {
        let mut recognizer = ScriptedRecognizer::default();
        recognizer.answers.insert(
            FULL_IMAGE_REGION.into(),
            vec![
                TextBlock::new("  Process\n\tstep ", Bbox::from_xywh(10.0, 10.0, 40.0, 10.0), 0.9),
                TextBlock::new("--", Bbox::from_xywh(10.0, 30.0, 40.0, 10.0), 0.9),
                TextBlock::new("Faint", Bbox::from_xywh(10.0, 50.0, 40.0, 10.0), 0.3),
                TextBlock::new("Whole", Bbox::from_xywh(0.0, 0.0, 0.0, 0.0), 0.8),
            ],
        );
        let text = TextRecognition::new(Arc::new(recognizer), &config());

        let image = DynamicImage::new_rgb8(120, 80);
        let regions = vec![TextRegion {
            id: FULL_IMAGE_REGION.into(),
            bbox: Bbox::from_xywh(0.0, 0.0, 120.0, 80.0),
            category: None,
        }];
        let output = text.recognize(&image, &regions, 0.6).await;

        let texts: Vec<&str> = output.blocks.iter().map(|block| block.text.as_str()).collect();
        assert_eq!(texts, vec!["Process step", "Whole"]);
        // An empty box falls back to the region
        assert_eq!(output.blocks[1].bbox, Bbox::from_xywh(0.0, 0.0, 120.0, 80.0));
        assert!(output.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_formula_gets_notation() {
        let formula = TextBlock {
            notation: Some(r"$$\frac{a}{b$$".into()),
            ..TextBlock::new("a/b = c", Bbox::from_xywh(20.0, 20.0, 40.0, 20.0), 0.9)
        };
        let recognizer = StaticRecognizer::new(vec![formula]);
        let text = TextRecognition::new(Arc::new(recognizer), &config());

        let image = DynamicImage::new_rgb8(100, 100);
        let regions = vec![region(
            "element_0000",
            Bbox::from_xywh(10.0, 10.0, 80.0, 50.0),
            Category::Formula,
        )];
        let output = text.recognize(&image, &regions, 0.6).await;

        assert_eq!(output.blocks.len(), 1);
        assert!(output.blocks[0].is_formula);
        assert_eq!(output.blocks[0].notation.as_deref(), Some(r"$\frac{a}{b}$"));
        assert_eq!(output.blocks[0].display_value(), r"$\frac{a}{b}$");
    }

    #[test]
    fn test_full_image_region_when_no_text_elements() {
        let bbox = Bbox::from_xywh(0.0, 0.0, 10.0, 10.0);
        let shape = Element::new("element_0000", Category::Shape, bbox, 0.9);
        let regions = TextRegion::collect(&[shape], 64, 32);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].id, FULL_IMAGE_REGION);
        assert_eq!(regions[0].bbox, Bbox::from_xywh(0.0, 0.0, 64.0, 32.0));
    }

    #[test]
    fn test_no_regions_without_elements() {
        assert!(TextRegion::collect(&[], 64, 32).is_empty());
    }

    #[test]
    fn test_arrange_dedups_and_orders() {
        let blocks = vec![
            TextBlock::new("B", Bbox::from_xywh(100.0, 12.0, 30.0, 10.0), 0.8),
            TextBlock::new("C", Bbox::from_xywh(10.0, 50.0, 30.0, 10.0), 0.8),
            TextBlock::new("A", Bbox::from_xywh(10.0, 10.0, 30.0, 10.0), 0.7),
            // Same place as A, more confident
            TextBlock::new("A'", Bbox::from_xywh(11.0, 10.0, 30.0, 10.0), 0.9),
            // Same place as B, equally confident, loses to the earlier one
            TextBlock::new("B'", Bbox::from_xywh(101.0, 12.0, 30.0, 10.0), 0.8),
        ];

        let arranged = arrange(blocks, 0.5);
        let texts: Vec<&str> = arranged.iter().map(|block| block.text.as_str()).collect();
        // A' and B share a band: centers 15 and 17 within 10 / 2
        assert_eq!(texts, vec!["A'", "B", "C"]);
        let ids: Vec<&str> = arranged.iter().map(|block| block.id.as_str()).collect();
        assert_eq!(ids, vec!["text_0000", "text_0001", "text_0002"]);
    }

    #[test]
    fn test_clean_text() {
        assert_eq!(clean_text("a\u{0}b  \n c", false), "a b c");
        assert_eq!(clean_text("   ", true), "");
    }
}

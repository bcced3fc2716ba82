//! Scores a document against the image it was reconstructed from.

pub mod metrics;

use std::collections::BTreeMap;

use image::{DynamicImage, GenericImageView, RgbImage, imageops::FilterType};
use serde::Serialize;
use tracing::*;

use crate::{
    analysis::labels::Category,
    consts::{EVAL_MAX_SIDE, FOREGROUND_DELTA, INCOMPLETE_FACTOR, UNSUPPORTED_FACTOR},
    layout::document::{Document, Node},
};

/// Overall score plus one sub-score per node id.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Evaluation {
    pub score: f32,
    pub subscores: BTreeMap<String, f32>,
}

impl Evaluation {
    pub fn subscore(&self, id: &str) -> Option<f32> {
        self.subscores.get(id).copied()
    }
}

/// Scores reconstructions. Implementations must be deterministic and must
/// not lower the score when a node is added or a sub-score rises.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, document: &Document, image: &DynamicImage) -> Evaluation;
}

/// Foreground coverage weighted by node quality.
///
/// Every foreground pixel counts the best sub-score among the nodes whose
/// box covers it; the score is the mean over all foreground pixels. An image
/// without foreground scores 1.0. Background nodes get a sub-score but never
/// cover pixels, otherwise a single full-page node would explain everything.
#[derive(Debug, Clone)]
pub struct QualityEvaluator {
    max_side: u32,
    delta: u8,
}

impl Default for QualityEvaluator {
    fn default() -> Self {
        Self {
            max_side: EVAL_MAX_SIDE,
            delta: FOREGROUND_DELTA,
        }
    }
}

impl QualityEvaluator {
    pub fn new(max_side: u32, delta: u8) -> Self {
        Self {
            max_side: max_side.max(1),
            delta,
        }
    }

    fn downscale(&self, image: &DynamicImage) -> RgbImage {
        let (width, height) = image.dimensions();
        let long_side = width.max(height);
        if long_side <= self.max_side {
            return image.to_rgb8();
        }
        let scale = self.max_side as f32 / long_side as f32;
        let target_width = ((width as f32 * scale).round() as u32).max(1);
        let target_height = ((height as f32 * scale).round() as u32).max(1);
        image
            .resize_exact(target_width, target_height, FilterType::Triangle)
            .to_rgb8()
    }
}

impl Evaluator for QualityEvaluator {
    #[tracing::instrument(skip_all)]
    fn evaluate(&self, document: &Document, image: &DynamicImage) -> Evaluation {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Evaluation {
                score: 1.0,
                subscores: document
                    .nodes
                    .iter()
                    .map(|node| (node.id.clone(), node_score(node, true)))
                    .collect(),
            };
        }

        let small = self.downscale(image);
        let (small_width, small_height) = small.dimensions();
        let background = border_color(&small);
        let foreground: Vec<bool> = small
            .pixels()
            .map(|pixel| {
                pixel
                    .0
                    .iter()
                    .zip(background)
                    .any(|(&channel, reference)| channel.abs_diff(reference) > self.delta)
            })
            .collect();
        let foreground_count = foreground.iter().filter(|&&set| set).count();

        let scale_x = small_width as f32 / width as f32;
        let scale_y = small_height as f32 / height as f32;
        let mut best = vec![0.0f32; foreground.len()];
        let mut subscores = BTreeMap::new();

        for node in &document.nodes {
            let x0 = ((node.bbox.min.x * scale_x).floor().max(0.0) as u32).min(small_width);
            let y0 = ((node.bbox.min.y * scale_y).floor().max(0.0) as u32).min(small_height);
            let x1 = ((node.bbox.max.x * scale_x).ceil().max(0.0) as u32).min(small_width);
            let y1 = ((node.bbox.max.y * scale_y).ceil().max(0.0) as u32).min(small_height);
            let covered = || {
                (y0..y1).flat_map(move |y| (x0..x1).map(move |x| (y * small_width + x) as usize))
            };

            let supported = covered().any(|index| foreground[index]);
            let score = node_score(node, supported);
            subscores.insert(node.id.clone(), score);

            if node.category == Category::Background {
                continue;
            }
            for index in covered().filter(|&index| foreground[index]) {
                best[index] = best[index].max(score);
            }
        }

        let score = if foreground_count == 0 {
            1.0
        } else {
            let total: f64 = best.iter().map(|&value| f64::from(value)).sum();
            (total / foreground_count as f64) as f32
        };

        debug!(
            "Evaluated {} nodes over {} foreground pixels: {:.4}",
            document.len(),
            foreground_count,
            score
        );
        Evaluation { score, subscores }
    }
}

/// Confidence, halved when the node is incomplete and halved again when
/// its box holds no foreground.
pub fn node_score(node: &Node, supported: bool) -> f32 {
    let degraded = node.style.get("degraded") == Some("1");
    let dangling = node.is_edge() && node.style.get("dangling") == Some("1");
    let empty_text = node.category.is_textual() && node.value.trim().is_empty();

    let completeness = if degraded || dangling || empty_text {
        INCOMPLETE_FACTOR
    } else {
        1.0
    };
    let support = if supported { 1.0 } else { UNSUPPORTED_FACTOR };
    node.confidence.clamp(0.0, 1.0) * completeness * support
}

/// Most frequent color on the image border.
fn border_color(image: &RgbImage) -> [u8; 3] {
    let (width, height) = image.dimensions();
    let mut counts: BTreeMap<[u8; 3], usize> = BTreeMap::new();
    for (x, y, pixel) in image.enumerate_pixels() {
        if x == 0 || y == 0 || x + 1 == width || y + 1 == height {
            *counts.entry(pixel.0).or_default() += 1;
        }
    }
    counts
        .into_iter()
        .max_by_key(|&(_, count)| count)
        .map(|(color, _)| color)
        .unwrap_or([255, 255, 255])
}

use std::{path::Path, time::Duration};

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};

use crate::{
    consts::*,
    error::{FerrdiagError, InvalidInputSnafu, IoReadSnafu, JsonSnafu},
};

/// Options of one reconstruction run.
///
/// ```
/// use ferrdiag_core::config::ReconstructConfigBuilder;
/// let config = ReconstructConfigBuilder::default()
///     .quality_threshold(0.9)
///     .max_iterations(5usize)
///     .build()
///     .unwrap();
/// assert_eq!(config.max_iterations, 5);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[builder(default)]
#[serde(default)]
pub struct ReconstructConfig {
    pub min_element_confidence: f32,
    pub min_text_confidence: f32,
    pub overlap_merge_threshold: f32,
    pub quality_threshold: f32,
    pub max_iterations: usize,

    pub min_mask_area: u32,
    pub arrow_tolerance: f32,
    pub degraded_penalty: f32,
    pub upscale_min_side: u32,

    pub recognition_batch_size: usize,
    pub recognition_max_in_flight: usize,
    pub recognition_timeout_ms: u64,
    pub recognition_max_attempts: usize,
    pub recognition_backoff_ms: u64,
    pub text_dedup_iou: f32,
    /// Repair mojibake and control characters in recognized text.
    pub trim_control_chars: bool,

    pub refine_expansion: f32,
    pub text_floor_step: f32,
}

impl Default for ReconstructConfig {
    fn default() -> Self {
        Self {
            min_element_confidence: MIN_ELEMENT_CONFIDENCE,
            min_text_confidence: MIN_TEXT_CONFIDENCE,
            overlap_merge_threshold: OVERLAP_MERGE_THRESHOLD,
            quality_threshold: QUALITY_THRESHOLD,
            max_iterations: MAX_ITERATIONS,
            min_mask_area: MIN_MASK_AREA,
            arrow_tolerance: ARROW_TOLERANCE,
            degraded_penalty: DEGRADED_PENALTY,
            upscale_min_side: UPSCALE_MIN_SIDE,
            recognition_batch_size: RECOGNITION_BATCH_SIZE,
            recognition_max_in_flight: RECOGNITION_MAX_IN_FLIGHT,
            recognition_timeout_ms: RECOGNITION_TIMEOUT_MS,
            recognition_max_attempts: RECOGNITION_MAX_ATTEMPTS,
            recognition_backoff_ms: RECOGNITION_BACKOFF_MS,
            text_dedup_iou: TEXT_DEDUP_IOU,
            trim_control_chars: true,
            refine_expansion: REFINE_EXPANSION,
            text_floor_step: TEXT_FLOOR_STEP,
        }
    }
}

impl ReconstructConfig {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, FerrdiagError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).context(IoReadSnafu {
            path: path.display().to_string(),
        })?;
        serde_json::from_str(&json).context(JsonSnafu { stage: "config" })
    }

    pub fn recognition_timeout(&self) -> Duration {
        Duration::from_millis(self.recognition_timeout_ms)
    }

    pub fn recognition_backoff(&self) -> Duration {
        Duration::from_millis(self.recognition_backoff_ms)
    }

    /// Evaluate passes actually allowed; at least one.
    pub fn iteration_budget(&self) -> usize {
        self.max_iterations.max(1)
    }

    pub fn validate(&self) -> Result<(), FerrdiagError> {
        let unit = [
            ("min_element_confidence", self.min_element_confidence),
            ("min_text_confidence", self.min_text_confidence),
            ("overlap_merge_threshold", self.overlap_merge_threshold),
            ("quality_threshold", self.quality_threshold),
            ("degraded_penalty", self.degraded_penalty),
            ("text_dedup_iou", self.text_dedup_iou),
            ("text_floor_step", self.text_floor_step),
        ];
        for (name, value) in unit {
            ensure!(
                (0.0..=1.0).contains(&value),
                InvalidInputSnafu {
                    stage: "config",
                    message: format!("`{name}` must be within [0, 1], got {value}"),
                }
            );
        }
        ensure!(
            self.arrow_tolerance.is_finite() && self.arrow_tolerance >= 0.0,
            InvalidInputSnafu {
                stage: "config",
                message: format!("`arrow_tolerance` must be >= 0, got {}", self.arrow_tolerance),
            }
        );
        ensure!(
            self.refine_expansion.is_finite() && self.refine_expansion >= 0.0,
            InvalidInputSnafu {
                stage: "config",
                message: format!("`refine_expansion` must be >= 0, got {}", self.refine_expansion),
            }
        );
        ensure!(
            self.recognition_batch_size > 0
                && self.recognition_max_in_flight > 0
                && self.recognition_max_attempts > 0,
            InvalidInputSnafu {
                stage: "config",
                message: "recognition batch size, in-flight limit and attempts must be positive",
            }
        );
        Ok(())
    }
}

/// Minimum confidence for keeping a segmented region as an element.
///
/// Regions scoring below this value are dropped by the extractor rather than
/// kept with a flag. Callers that need low-confidence candidates should lower
/// the threshold in the run configuration.
pub const MIN_ELEMENT_CONFIDENCE: f32 = 0.5;

/// Minimum confidence for keeping a recognized text block.
///
/// The refinement loop lowers this floor step by step for regions that
/// scored poorly, see [`TEXT_FLOOR_STEP`].
pub const MIN_TEXT_CONFIDENCE: f32 = 0.6;

/// IoU above which two nodes of the same category are merged.
///
/// The lower-confidence node is dropped. 0.9 only collapses near-identical
/// stacked primitives and keeps nested boxes (a shape inside a container)
/// apart.
pub const OVERLAP_MERGE_THRESHOLD: f32 = 0.9;

/// Score a reconstruction must reach before the refinement loop stops early.
pub const QUALITY_THRESHOLD: f32 = 0.8;

/// Upper bound on evaluate passes in one run.
pub const MAX_ITERATIONS: usize = 3;

/// Minimum number of mask pixels for a region to become an element.
///
/// Smaller masks are almost always speckle from the segmentation model.
pub const MIN_MASK_AREA: u32 = 100;

/// Mask values strictly above this are considered foreground.
pub const MASK_THRESHOLD: u8 = 127;

/// Overlap ratio at which an element is treated as contained in a container
/// (shape or picture) and grouped under it.
pub const GROUP_CONTAINMENT_RATIO: f32 = 0.95;

/// Confidence removed from an element a processor could not refine.
pub const DEGRADED_PENALTY: f32 = 0.2;

/// Distance in pixels within which an arrow endpoint snaps to an anchor.
pub const ARROW_TOLERANCE: f32 = 20.0;

/// Fraction of an arrow's length at each end whose mask mass is compared
/// to decide which end carries the head.
pub const ARROW_END_FRACTION: f32 = 0.25;

/// Crops whose shorter side is below this are upsampled before embedding.
pub const UPSCALE_MIN_SIDE: u32 = 64;

/// Upsampling factor for small icon and picture crops.
pub const UPSCALE_FACTOR: u32 = 2;

/// Douglas-Peucker epsilon as a fraction of the contour perimeter.
pub const POLYGON_EPSILON_FACTOR: f64 = 0.02;

/// Number of regions sent to the recognizer per batch.
pub const RECOGNITION_BATCH_SIZE: usize = 5;

/// Maximum number of recognizer calls in flight at once.
pub const RECOGNITION_MAX_IN_FLIGHT: usize = 4;

/// Per-call recognizer timeout in milliseconds.
pub const RECOGNITION_TIMEOUT_MS: u64 = 30_000;

/// Attempts per region before the region is reported as failed.
pub const RECOGNITION_MAX_ATTEMPTS: usize = 3;

/// Base backoff between recognizer retries in milliseconds, doubled per retry.
pub const RECOGNITION_BACKOFF_MS: u64 = 200;

/// IoU above which two recognized text blocks are near-duplicates.
pub const TEXT_DEDUP_IOU: f32 = 0.5;

/// Notation longer than this is rendered as display math (`$$...$$`).
pub const DISPLAY_MATH_MIN_LEN: usize = 50;

/// Fraction of the box size added on each side per refinement iteration.
pub const REFINE_EXPANSION: f32 = 0.05;

/// How much the text confidence floor drops per refinement iteration.
pub const TEXT_FLOOR_STEP: f32 = 0.1;

/// Font size of text nodes whose box gives no usable height.
pub const TEXT_FONT_SIZE: u32 = 12;

/// Font size of formula nodes whose box gives no usable height.
pub const FORMULA_FONT_SIZE: u32 = 14;

/// Points per pixel of line height; cap height plus leading is about 4/3 of
/// the em size.
pub const FONT_SIZE_PER_PIXEL: f32 = 0.75;

pub const MIN_FONT_SIZE: u32 = 8;
pub const MAX_FONT_SIZE: u32 = 48;

/// Long side in pixels the evaluator works at.
///
/// Scoring is coverage based, so a downscaled image gives the same ranking
/// at a fraction of the cost.
pub const EVAL_MAX_SIDE: u32 = 512;

/// Per-channel color distance from the background above which a pixel is
/// foreground (ink).
pub const FOREGROUND_DELTA: u8 = 40;

/// Completeness factor for degraded nodes, dangling arrows and empty text.
pub const INCOMPLETE_FACTOR: f32 = 0.5;

/// Support factor for nodes whose box covers no foreground at all.
pub const UNSUPPORTED_FACTOR: f32 = 0.5;

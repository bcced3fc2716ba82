pub mod segmentation;

pub use segmentation::{SegmentationExtractor, SegmentationResult, validate_image};

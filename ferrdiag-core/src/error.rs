use snafu::prelude::*;

/// Fatal errors. Any of these aborts a reconstruction run.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum FerrdiagError {
    #[snafu(display("Invalid input at stage `{}`: {}", stage, message))]
    InvalidInput { stage: String, message: String },
    #[snafu(display("Segmentation output unavailable: {}", message))]
    ModelUnavailable { message: String },
    #[snafu(display("Merge conflict, node id `{}` claimed twice", id))]
    MergeConflict { id: String },
    #[snafu(display("Document xml error at `{}`: {}", stage, message))]
    Xml { stage: String, message: String },
    #[snafu(display("Refine element `{}` error: {}", id, message))]
    Refinement { id: String, message: String },
    #[snafu(display("Encode `{}` error: {}", stage, source))]
    Encode {
        source: image::ImageError,
        stage: String,
    },
    #[snafu(display("Image Read `{}` error: {}", path, source))]
    ImageRead {
        source: image::ImageError,
        path: String,
    },
    #[snafu(display("Image Write error: {}", source))]
    ImageWrite {
        source: image::ImageError,
        path: String,
    },
    #[snafu(display("Read `{}` error: {}", path, source))]
    IoRead {
        source: std::io::Error,
        path: String,
    },
    #[snafu(display("Write `{}` error: {}", path, source))]
    IoWrite {
        source: std::io::Error,
        path: String,
    },
    #[snafu(display("Json `{}` error: {}", stage, source))]
    Json {
        source: serde_json::Error,
        stage: String,
    },
    #[snafu(display("Blocking task `{}` failed: {}", stage, source))]
    Join {
        source: tokio::task::JoinError,
        stage: String,
    },
}

/// Failure of a single call into a [`crate::inference::recognizer::Recognizer`].
///
/// These never abort a run. The text subsystem retries them and finally turns
/// them into a [`Warning`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RecognitionError {
    #[snafu(display("Recognizer backend error: {}", message))]
    Backend { message: String },
}

/// Non-fatal conditions collected on the final result.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    RecognitionTimeout {
        region: String,
        attempts: usize,
    },
    RecognitionFailure {
        region: String,
        attempts: usize,
        message: String,
    },
    ElementRefinementDegraded {
        id: String,
        processor: String,
        message: String,
    },
    QualityBelowThresholdAfterMaxIterations {
        score: f32,
        threshold: f32,
        iterations: usize,
    },
}

impl Warning {
    /// Region or element id the warning is about, if any.
    pub fn subject(&self) -> Option<&str> {
        match self {
            Warning::RecognitionTimeout { region, .. }
            | Warning::RecognitionFailure { region, .. } => Some(region),
            Warning::ElementRefinementDegraded { id, .. } => Some(id),
            Warning::QualityBelowThresholdAfterMaxIterations { .. } => None,
        }
    }
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Warning::RecognitionTimeout { region, attempts } => {
                write!(f, "recognition of `{region}` timed out after {attempts} attempts")
            }
            Warning::RecognitionFailure {
                region,
                attempts,
                message,
            } => write!(
                f,
                "recognition of `{region}` failed after {attempts} attempts: {message}"
            ),
            Warning::ElementRefinementDegraded {
                id,
                processor,
                message,
            } => write!(f, "{processor} could not refine `{id}`: {message}"),
            Warning::QualityBelowThresholdAfterMaxIterations {
                score,
                threshold,
                iterations,
            } => write!(
                f,
                "score {score:.3} below threshold {threshold:.3} after {iterations} iterations"
            ),
        }
    }
}

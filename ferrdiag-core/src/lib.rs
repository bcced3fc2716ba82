pub mod analysis;
pub mod compose;
pub mod config;
pub mod consts;
pub mod debug;
pub mod error;
pub mod evaluate;
pub mod extract;
pub mod inference;
pub mod layout;
pub mod pipeline;
pub mod process;
pub mod refine;
pub mod text;

// Re-export commonly used types
pub use config::{ReconstructConfig, ReconstructConfigBuilder};
pub use error::{FerrdiagError, Warning};
pub use layout::document::Document;
pub use pipeline::{Reconstruction, Reconstructor};

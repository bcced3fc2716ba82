pub mod model;
pub mod recognizer;

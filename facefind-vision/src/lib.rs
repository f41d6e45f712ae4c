pub mod align;
pub mod face;
pub mod model;
pub mod pipeline;
pub mod yunet;

// Re-export commonly used types
pub use face::{distance, Detection, Embedding, SAME_PERSON_DISTANCE};
pub use pipeline::Pipeline;

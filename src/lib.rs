pub mod config;
pub mod embedding;
pub mod fetch;
pub mod indexer;
pub mod matcher;
pub mod onnx;
pub mod provider;
pub mod remote;
pub mod search;
pub mod store;

// Re-export vision types for convenience
pub use facefind_vision::{Detection, Embedding};

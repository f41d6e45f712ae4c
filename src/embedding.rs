//! Conversion between the provider's native embedding and the plain numeric
//! arrays the store endpoint speaks. Nothing else in the crate touches the
//! wire representation of a vector.

use ndarray::Array1;
use thiserror::Error;

use crate::Embedding;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EmbeddingError {
    #[error("embedding has no components")]
    Empty,
    #[error("embedding component {index} is not a finite number")]
    NonFinite { index: usize },
}

/// Flatten an embedding into a plain array for serialization.
pub fn to_wire(embedding: &Embedding) -> Vec<f32> {
    embedding.vector.iter().copied().collect()
}

/// Rebuild an embedding from a plain array, rejecting empty or non-finite input.
pub fn from_wire(values: Vec<f32>) -> Result<Embedding, EmbeddingError> {
    if values.is_empty() {
        return Err(EmbeddingError::Empty);
    }
    if let Some(index) = values.iter().position(|v| !v.is_finite()) {
        return Err(EmbeddingError::NonFinite { index });
    }
    Ok(Embedding::new(Array1::from(values)))
}

//! Error types for the CRDT primitives.

use thiserror::Error;

/// Errors raised while encoding or decoding replicated state.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;

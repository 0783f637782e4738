//! Error types for the meshdir SDK.

use crate::network::NetworkError;
use meshdir_core::CoreError;
use meshdir_delta::SyncError;
use thiserror::Error;

/// Error type for SDK operations.
#[derive(Error, Debug)]
pub enum SdkError {
    /// No node is stored under the key.
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// The local node does not belong to the mesh.
    #[error("Mesh not found: {0}")]
    MeshNotFound(String),

    /// A session's transport failed.
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// A session did not finish before its deadline.
    #[error("Sync with {peer} timed out after {timeout_ms}ms")]
    Timeout { peer: String, timeout_ms: u64 },

    /// A handshake message could not be decoded.
    #[error("Sync message error: {0}")]
    Decode(#[from] SyncError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Result type for SDK operations.
pub type Result<T> = std::result::Result<T, SdkError>;

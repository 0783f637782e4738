//! Error types for sync sessions.

use crate::syncer::SyncPhase;
use thiserror::Error;

/// Failures observed while driving a handshake.
///
/// Decode and encode failures do not abort a session: the offending message
/// is treated as empty and the failure is recorded on the syncer.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Failed to decode {phase} message: {source}")]
    Decode {
        phase: SyncPhase,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode {phase} message: {source}")]
    Encode {
        phase: SyncPhase,
        #[source]
        source: serde_json::Error,
    },

    #[error("No peer message available for {0} phase")]
    MissingMessage(SyncPhase),

    #[error("Session already finished")]
    Finished,
}

pub type Result<T> = std::result::Result<T, SyncError>;

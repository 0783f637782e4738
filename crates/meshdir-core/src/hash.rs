//! Stable hashing for directory keys and bucket payloads.
//!
//! Replicas on different hosts must agree on `hash(key)`, so keys are hashed
//! with SHA-256 and truncated to 64 bits instead of using the per-process
//! randomized `std` hasher.

use sha2::{Digest, Sha256};

/// Hash an opaque key to the 64-bit bucket identifier used by every map.
pub fn key_hash(key: impl AsRef<[u8]>) -> u64 {
    let digest = Sha256::digest(key.as_ref());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// Full SHA-256 digest of a serialized payload.
pub fn payload_digest(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

/// First 64 bits of [`payload_digest`], big-endian.
///
/// Orders the same way as the full digest whenever two tags differ, so it can
/// stand in for the digest in clock summaries.
pub fn payload_tag(bytes: &[u8]) -> u64 {
    let digest = payload_digest(bytes);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

//! Meshdir Delta - Delta-state synchronization for the mesh directory
//!
//! This crate implements the four-phase handshake that two replicas run to
//! converge a [`meshdir_core::TwoPhaseMap`], plus an anti-entropy harness
//! that drives the handshake over a simulated lossy network.
//!
//! ## Handshake
//!
//! ```text
//! PREPARE:  send my clock summary              { hash -> version }
//! PRESENT:  send the keys I am behind on       { hash -> my version }
//! EXCHANGE: send buckets newer than requested  { hash -> bucket }
//! MERGE:    apply the buckets I received
//! ```
//!
//! Only the buckets the peer is missing ever cross the wire. Every message
//! is JSON; a message that fails to decode is treated as empty, so a bad
//! session never corrupts local state, it only delays convergence.
//!
//! # Example
//!
//! ```rust,ignore
//! use meshdir_core::{key_hash, TwoPhaseMap};
//! use meshdir_delta::{run_session, TwoPhaseSyncer};
//! use std::sync::Arc;
//!
//! let a = Arc::new(TwoPhaseMap::<String, String>::new(key_hash("a")));
//! let b = Arc::new(TwoPhaseMap::<String, String>::new(key_hash("b")));
//! a.put(&"k".to_string(), "v".to_string());
//!
//! run_session(&mut TwoPhaseSyncer::new(a), &mut TwoPhaseSyncer::new(b.clone()));
//! assert!(b.contains(&"k".to_string()));
//! ```

pub mod anti_entropy;
pub mod error;
pub mod syncer;

pub use anti_entropy::{
    AntiEntropyCluster,
    NetworkConfig,
    NetworkSimulator,
    SessionMessage,
    SessionStats,
};

pub use error::{Result, SyncError};

pub use syncer::{run_session, SyncPhase, TwoPhaseSyncer};

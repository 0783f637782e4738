//! Meshdir SDK - Replicated membership directory for peer-to-peer meshes
//!
//! This SDK wires the meshdir CRDTs into a gossiping mesh daemon: a
//! directory of nodes per mesh, a registry of meshes, a partitioner that
//! decides who talks to whom, and a scheduler that drives delta sync
//! sessions every round.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use meshdir_sdk::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> meshdir_sdk::Result<()> {
//!     let network = Arc::new(MemoryNetwork::new());
//!
//!     let registry = Arc::new(MeshRegistry::new("pk-a"));
//!     registry.create_mesh("mesh-1", MeshNode::new("pk-a", "host-a"));
//!     network.register("host-a", registry.clone());
//!
//!     let syncer = Syncer::new(registry, network, SyncConfig::default())?;
//!     syncer.sync_round("mesh-1").await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - [`node`] - Directory records (nodes, routes, roles)
//! - [`directory`] - One mesh's replicated directory
//! - [`registry`] - Every mesh the local node belongs to
//! - [`partition`] - Cluster bands and inter-cluster contacts
//! - [`sync`] - Round scheduling, sessions, events
//! - [`network`] - Transport abstractions and the in-memory network
//! - [`error`] - Error types

pub mod directory;
pub mod error;
pub mod network;
pub mod node;
pub mod partition;
pub mod registry;
pub mod sync;

// Re-exports for convenience
pub use directory::{MeshDirectory, NodeStore};
pub use error::{Result, SdkError};
pub use network::{ConnectionManager, Fault, MemoryNetwork, MemoryStream, NetworkError, SyncStream};
pub use node::{MeshNode, NodeType, Route};
pub use partition::ConnectionClusterer;
pub use registry::MeshRegistry;
pub use sync::{
    drive_session, serve_session, MarkUnreachable, MeshConfigApplier, NoopApplier, RoundReport,
    SyncConfig, SyncConfigBuilder, SyncErrorHandler, SyncEvent, Syncer,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::directory::MeshDirectory;
    pub use crate::error::SdkError;
    pub use crate::network::{ConnectionManager, MemoryNetwork};
    pub use crate::node::{MeshNode, NodeType, Route};
    pub use crate::registry::MeshRegistry;
    pub use crate::sync::{SyncConfig, SyncConfigBuilder, SyncEvent, Syncer};
}

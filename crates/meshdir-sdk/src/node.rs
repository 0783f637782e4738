//! Directory records: one [`MeshNode`] per physical host in a mesh.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Role of a node in the mesh.
///
/// Clients consume the mesh but never take part in gossip fan-out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    #[default]
    Peer,
    Client,
}

/// A route advertised by a node.
///
/// `path` lists the meshes the advertisement has already crossed so that a
/// route is never propagated back into a mesh it came from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub destination: String,
    pub hop_count: u32,
    pub path: Vec<String>,
}

impl Route {
    pub fn new(destination: impl Into<String>, hop_count: u32) -> Self {
        Self {
            destination: destination.into(),
            hop_count,
            path: Vec::new(),
        }
    }

    pub fn with_path(mut self, path: Vec<String>) -> Self {
        self.path = path;
        self
    }

    /// True if the route already passed through `mesh_id`.
    pub fn traverses(&self, mesh_id: &str) -> bool {
        self.path.iter().any(|hop| hop == mesh_id)
    }
}

/// One host's entry in a mesh directory.
///
/// Maps are `BTreeMap` so the serialized form is deterministic, which the
/// directory's equal-version tie-break relies on.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshNode {
    /// Control-plane endpoint used to open sync sessions
    pub host_endpoint: String,
    /// WireGuard listen endpoint
    pub wg_endpoint: String,
    /// WireGuard public key; also the node's directory key
    pub public_key: String,
    /// Overlay address
    pub wg_host: String,
    /// Last refresh, milliseconds since the Unix epoch
    pub timestamp: i64,
    pub routes: BTreeMap<String, Route>,
    pub description: String,
    pub alias: String,
    pub services: BTreeMap<String, String>,
    pub node_type: NodeType,
}

impl MeshNode {
    pub fn new(public_key: impl Into<String>, host_endpoint: impl Into<String>) -> Self {
        Self {
            public_key: public_key.into(),
            host_endpoint: host_endpoint.into(),
            timestamp: Utc::now().timestamp_millis(),
            ..Default::default()
        }
    }

    pub fn with_wg(mut self, wg_endpoint: impl Into<String>, wg_host: impl Into<String>) -> Self {
        self.wg_endpoint = wg_endpoint.into();
        self.wg_host = wg_host.into();
        self
    }

    pub fn with_type(mut self, node_type: NodeType) -> Self {
        self.node_type = node_type;
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    pub fn is_peer(&self) -> bool {
        self.node_type == NodeType::Peer
    }

    /// Stamp the node with the current wall-clock time.
    pub fn touch(&mut self) {
        self.timestamp = Utc::now().timestamp_millis().max(self.timestamp + 1);
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.timestamp).single()
    }
}

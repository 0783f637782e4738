//! The replicated mesh directory.
//!
//! A [`MeshDirectory`] is a [`TwoPhaseMap`] of [`MeshNode`]s keyed by public
//! key. Every mutation reads the current record, applies the edit and writes
//! the whole record back with a fresh stamp, retrying if the record moved in
//! between. Edits that would not change the record are skipped so they do not
//! trigger a gossip round.

use crate::error::{Result, SdkError};
use crate::node::{MeshNode, Route};
use meshdir_core::hash::key_hash;
use meshdir_core::twophase::TwoPhaseMap;
use meshdir_delta::TwoPhaseSyncer;
use std::sync::Arc;
use tracing::{debug, info};

/// The store type behind a mesh directory.
pub type NodeStore = TwoPhaseMap<String, MeshNode>;

/// One mesh as seen by the local node.
pub struct MeshDirectory {
    mesh_id: String,
    local_key: String,
    store: Arc<NodeStore>,
}

impl MeshDirectory {
    /// Create an empty directory. The clock is owned by `local_key`, so the
    /// local node's own record is never reported as stale.
    pub fn new(mesh_id: impl Into<String>, local_key: impl Into<String>) -> Self {
        let local_key = local_key.into();
        Self {
            mesh_id: mesh_id.into(),
            store: Arc::new(TwoPhaseMap::new(key_hash(&local_key))),
            local_key,
        }
    }

    pub fn mesh_id(&self) -> &str {
        &self.mesh_id
    }

    pub fn local_key(&self) -> &str {
        &self.local_key
    }

    pub fn store(&self) -> &Arc<NodeStore> {
        &self.store
    }

    /// Insert or replace a node, stamped with the current time.
    pub fn add_node(&self, mut node: MeshNode) {
        node.touch();
        debug!(mesh = %self.mesh_id, node = %node.public_key, "adding node");
        let key = node.public_key.clone();
        self.store.put(&key, node);
    }

    pub fn get_node(&self, key: &str) -> Result<MeshNode> {
        self.store
            .get(&key.to_string())
            .ok_or_else(|| SdkError::NodeNotFound(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.store.contains(&key.to_string())
    }

    /// Replicated removal.
    pub fn remove_node(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        if !self.store.contains(&key) {
            return Err(SdkError::NodeNotFound(key));
        }
        info!(mesh = %self.mesh_id, node = %key, "removing node");
        self.store.remove(&key);
        Ok(())
    }

    pub fn set_description(&self, key: &str, description: &str) -> Result<()> {
        self.update(key, |node| {
            if node.description == description {
                return false;
            }
            node.description = description.to_string();
            true
        })
    }

    pub fn set_alias(&self, key: &str, alias: &str) -> Result<()> {
        self.update(key, |node| {
            if node.alias == alias {
                return false;
            }
            node.alias = alias.to_string();
            true
        })
    }

    pub fn add_service(&self, key: &str, service: &str, value: &str) -> Result<()> {
        self.update(key, |node| {
            if node.services.get(service).map(String::as_str) == Some(value) {
                return false;
            }
            node.services.insert(service.to_string(), value.to_string());
            true
        })
    }

    pub fn remove_service(&self, key: &str, service: &str) -> Result<()> {
        self.update(key, |node| node.services.remove(service).is_some())
    }

    /// Advertise routes. A route replaces an existing one to the same
    /// destination only if it differs.
    pub fn add_routes(&self, key: &str, routes: Vec<Route>) -> Result<()> {
        self.update(key, |node| {
            let mut changed = false;
            for route in &routes {
                if node.routes.get(&route.destination) != Some(route) {
                    node.routes.insert(route.destination.clone(), route.clone());
                    changed = true;
                }
            }
            changed
        })
    }

    pub fn remove_routes(&self, key: &str, destinations: &[String]) -> Result<()> {
        self.update(key, |node| {
            let before = node.routes.len();
            for destination in destinations {
                node.routes.remove(destination);
            }
            node.routes.len() != before
        })
    }

    /// Refresh a node's timestamp, re-stamping its record.
    pub fn update_timestamp(&self, key: &str) -> Result<()> {
        self.update(key, |node| {
            node.touch();
            true
        })
    }

    /// Flag a node as unreachable. Local only.
    pub fn mark(&self, key: &str) {
        self.store.mark(&key.to_string());
    }

    pub fn unmark(&self, key: &str) {
        self.store.unmark(&key.to_string());
    }

    pub fn is_marked(&self, key: &str) -> bool {
        self.store.is_marked(&key.to_string())
    }

    pub fn has_changes(&self) -> bool {
        self.store.has_changes()
    }

    pub fn save_changes(&self) {
        self.store.save_changes()
    }

    /// Keys of reachable peer-role nodes, sorted.
    pub fn get_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .store
            .as_map()
            .into_iter()
            .filter(|(hash, node)| node.is_peer() && !self.store.is_marked_hash(*hash))
            .map(|(_, node)| node.public_key)
            .collect();
        peers.sort();
        peers
    }

    /// Every present node, sorted by key.
    pub fn get_nodes(&self) -> Vec<MeshNode> {
        let mut nodes: Vec<MeshNode> = self.store.as_map().into_values().collect();
        nodes.sort_by(|a, b| a.public_key.cmp(&b.public_key));
        nodes
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// A fresh handshake driver bound to this directory.
    pub fn syncer(&self) -> TwoPhaseSyncer<String, MeshNode> {
        TwoPhaseSyncer::new(self.store.clone())
    }

    /// Full-state bytes for bootstrapping a joining node.
    pub fn save(&self) -> Result<Vec<u8>> {
        Ok(self.store.save_bytes()?)
    }

    /// Merge full-state bytes produced by [`MeshDirectory::save`].
    pub fn load(&self, bytes: &[u8]) -> Result<usize> {
        Ok(self.store.load_bytes(bytes)?)
    }

    /// Drop records whose stamps lag far behind the rest of the mesh.
    pub fn prune(&self, deviations: f64) -> Vec<u64> {
        let pruned = self.store.prune(deviations);
        if !pruned.is_empty() {
            info!(mesh = %self.mesh_id, count = pruned.len(), "pruned stale nodes");
        }
        pruned
    }

    fn update<F>(&self, key: &str, mut edit: F) -> Result<()>
    where
        F: FnMut(&mut MeshNode) -> bool,
    {
        let key = key.to_string();
        loop {
            let (version, mut node) = self
                .store
                .get_versioned(&key)
                .ok_or_else(|| SdkError::NodeNotFound(key.clone()))?;
            if !edit(&mut node) {
                return Ok(());
            }
            if self.store.put_if_version(&key, version, node).is_some() {
                return Ok(());
            }
            debug!(mesh = %self.mesh_id, node = %key, "record moved during edit, retrying");
        }
    }
}

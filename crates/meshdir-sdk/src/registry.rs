//! Registry of every mesh the local node belongs to.

use crate::directory::MeshDirectory;
use crate::error::{Result, SdkError};
use crate::node::MeshNode;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Owns the local node's [`MeshDirectory`]s, keyed by mesh id.
///
/// Shared by `Arc` between the scheduler and the responder side of sync
/// sessions.
pub struct MeshRegistry {
    local_key: String,
    meshes: RwLock<HashMap<String, Arc<MeshDirectory>>>,
}

impl MeshRegistry {
    pub fn new(local_key: impl Into<String>) -> Self {
        Self {
            local_key: local_key.into(),
            meshes: RwLock::new(HashMap::new()),
        }
    }

    pub fn local_key(&self) -> &str {
        &self.local_key
    }

    /// Start a new mesh with `node` as its only member.
    pub fn create_mesh(&self, mesh_id: &str, node: MeshNode) -> Arc<MeshDirectory> {
        let mesh = Arc::new(MeshDirectory::new(mesh_id, self.local_key.clone()));
        mesh.add_node(node);
        info!(mesh = %mesh_id, "created mesh");
        self.meshes.write().insert(mesh_id.to_string(), mesh.clone());
        mesh
    }

    /// Join an existing mesh from a full-state snapshot, then advertise
    /// `node` in it.
    pub fn join_mesh(&self, mesh_id: &str, snapshot: &[u8], node: MeshNode) -> Result<Arc<MeshDirectory>> {
        let mesh = Arc::new(MeshDirectory::new(mesh_id, self.local_key.clone()));
        let loaded = mesh.load(snapshot)?;
        mesh.add_node(node);
        info!(mesh = %mesh_id, loaded, "joined mesh");
        self.meshes.write().insert(mesh_id.to_string(), mesh.clone());
        Ok(mesh)
    }

    pub fn get(&self, mesh_id: &str) -> Result<Arc<MeshDirectory>> {
        self.meshes
            .read()
            .get(mesh_id)
            .cloned()
            .ok_or_else(|| SdkError::MeshNotFound(mesh_id.to_string()))
    }

    /// Leave a mesh locally. Other members still see the node until it is
    /// removed or pruned.
    pub fn leave_mesh(&self, mesh_id: &str) -> Result<Arc<MeshDirectory>> {
        self.meshes
            .write()
            .remove(mesh_id)
            .ok_or_else(|| SdkError::MeshNotFound(mesh_id.to_string()))
    }

    pub fn mesh_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.meshes.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn meshes(&self) -> Vec<Arc<MeshDirectory>> {
        self.meshes.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.meshes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.meshes.read().is_empty()
    }
}

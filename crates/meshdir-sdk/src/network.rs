//! Transport abstractions for sync sessions.
//!
//! A session only needs an ordered, bidirectional stream of byte messages.
//! [`ConnectionManager`] opens one per session; [`MemoryNetwork`] is an
//! in-process implementation that answers each inbound stream with
//! [`serve_session`](crate::sync::serve_session).

use crate::registry::MeshRegistry;
use crate::sync::serve_session;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Network error type.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Endpoint not found: {0}")]
    EndpointNotFound(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Disconnected")]
    Disconnected,
}

/// One session's message stream.
#[async_trait]
pub trait SyncStream: Send {
    async fn send(&mut self, message: Vec<u8>) -> Result<(), NetworkError>;

    async fn receive(&mut self) -> Result<Vec<u8>, NetworkError>;
}

/// Opens sync streams to other nodes, keyed by endpoint.
#[async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    /// Open a session for `mesh_id`. `initiator` is the opening node's
    /// public key, handed to the far side so it can clear its mark.
    async fn open(
        &self,
        endpoint: &str,
        mesh_id: &str,
        initiator: &str,
    ) -> Result<Box<dyn SyncStream>, NetworkError>;
}

/// One half of an in-memory duplex stream.
pub struct MemoryStream {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl MemoryStream {
    /// Two connected halves.
    pub fn pair(buffer: usize) -> (MemoryStream, MemoryStream) {
        let (a_tx, b_rx) = mpsc::channel(buffer);
        let (b_tx, a_rx) = mpsc::channel(buffer);
        (
            MemoryStream { tx: a_tx, rx: a_rx },
            MemoryStream { tx: b_tx, rx: b_rx },
        )
    }
}

#[async_trait]
impl SyncStream for MemoryStream {
    async fn send(&mut self, message: Vec<u8>) -> Result<(), NetworkError> {
        self.tx
            .send(message)
            .await
            .map_err(|e| NetworkError::SendFailed(e.to_string()))
    }

    async fn receive(&mut self) -> Result<Vec<u8>, NetworkError> {
        self.rx.recv().await.ok_or(NetworkError::Disconnected)
    }
}

/// Injected failure for an endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Connections are refused.
    Unreachable,
    /// Connections open but the far side never answers.
    Silent,
}

/// In-process network of registries, for testing and simulation.
#[derive(Default)]
pub struct MemoryNetwork {
    endpoints: RwLock<HashMap<String, Arc<MeshRegistry>>>,
    faults: RwLock<HashMap<String, Fault>>,
    parked: Mutex<HashMap<String, Vec<MemoryStream>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `registry` at `endpoint`.
    pub fn register(&self, endpoint: impl Into<String>, registry: Arc<MeshRegistry>) {
        self.endpoints.write().insert(endpoint.into(), registry);
    }

    pub fn set_fault(&self, endpoint: &str, fault: Fault) {
        self.faults.write().insert(endpoint.to_string(), fault);
    }

    /// Lift the fault. Streams parked by [`Fault::Silent`] are dropped, which
    /// disconnects their clients.
    pub fn clear_fault(&self, endpoint: &str) {
        self.faults.write().remove(endpoint);
        self.parked.lock().remove(endpoint);
    }

    /// Streams currently held open by [`Fault::Silent`].
    pub fn parked(&self) -> usize {
        self.parked.lock().values().map(Vec::len).sum()
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.endpoints.read().keys().cloned().collect()
    }
}

#[async_trait]
impl ConnectionManager for MemoryNetwork {
    async fn open(
        &self,
        endpoint: &str,
        mesh_id: &str,
        initiator: &str,
    ) -> Result<Box<dyn SyncStream>, NetworkError> {
        let fault = self.faults.read().get(endpoint).copied();
        if fault == Some(Fault::Unreachable) {
            return Err(NetworkError::ConnectionFailed(endpoint.to_string()));
        }

        let registry = self
            .endpoints
            .read()
            .get(endpoint)
            .cloned()
            .ok_or_else(|| NetworkError::EndpointNotFound(endpoint.to_string()))?;

        let (client, server) = MemoryStream::pair(8);
        if fault == Some(Fault::Silent) {
            self.parked
                .lock()
                .entry(endpoint.to_string())
                .or_default()
                .push(server);
            return Ok(Box::new(client));
        }

        let mesh_id = mesh_id.to_string();
        let endpoint = endpoint.to_string();
        let initiator = initiator.to_string();
        tokio::spawn(async move {
            if let Err(e) = serve_session(registry, &mesh_id, &initiator, server).await {
                debug!(%endpoint, mesh = %mesh_id, error = %e, "inbound session failed");
            }
        });
        Ok(Box::new(client))
    }
}

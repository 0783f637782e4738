//! Delta-state synchronization handshake
//!
//! One [`TwoPhaseSyncer`] drives one side of a session. Both peers run the
//! same state machine over a duplex byte stream, so the protocol is
//! symmetric: each side's PREPARE message answers the other's PRESENT, and
//! so on.
//!
//! ```text
//! PREPARE  -> send local clock summary                       -> PRESENT
//! PRESENT  -> decode peer summary, send difference request   -> EXCHANGE
//! EXCHANGE -> decode peer request, send requested buckets    -> MERGE
//! MERGE    -> decode peer buckets, merge into the local map  -> FINISHED
//! ```
//!
//! A caller alternates [`TwoPhaseSyncer::generate_message`] and
//! [`TwoPhaseSyncer::recv_message`] until `generate_message` reports that
//! nothing more is to be sent, then calls [`TwoPhaseSyncer::complete`].

use crate::error::{Result, SyncError};
use meshdir_core::twophase::{TwoPhaseMap, TwoPhaseMapSnapshot, TwoPhaseMapState};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Phase of a sync session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncPhase {
    Prepare,
    Present,
    Exchange,
    Merge,
    Finished,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncPhase::Prepare => "PREPARE",
            SyncPhase::Present => "PRESENT",
            SyncPhase::Exchange => "EXCHANGE",
            SyncPhase::Merge => "MERGE",
            SyncPhase::Finished => "FINISHED",
        };
        f.write_str(name)
    }
}

/// One side of a delta sync session over a [`TwoPhaseMap`].
pub struct TwoPhaseSyncer<K, D> {
    map: Arc<TwoPhaseMap<K, D>>,
    phase: SyncPhase,
    peer_msg: Option<Vec<u8>>,
    failures: Vec<SyncError>,
    merged: usize,
}

impl<K, D> TwoPhaseSyncer<K, D>
where
    K: AsRef<[u8]>,
    D: Clone + Default + Serialize + DeserializeOwned,
{
    pub fn new(map: Arc<TwoPhaseMap<K, D>>) -> Self {
        Self {
            map,
            phase: SyncPhase::Prepare,
            peer_msg: None,
            failures: Vec::new(),
            merged: 0,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    /// Produce the next outbound message and advance the phase.
    ///
    /// Returns `(bytes, has_more)`; once `has_more` is false the session is
    /// over and `bytes` is empty.
    pub fn generate_message(&mut self) -> (Vec<u8>, bool) {
        match self.phase {
            SyncPhase::Prepare => {
                let summary = self.map.generate_message();
                debug!(keys = summary.len(), "sending clock summary");
                let bytes = self.encode(&summary);
                self.phase = SyncPhase::Present;
                (bytes, true)
            }
            SyncPhase::Present => {
                let peer_summary: TwoPhaseMapState = self.decode().unwrap_or_default();
                let request = self.map.generate_message().difference(&peer_summary);
                debug!(keys = request.len(), "requesting missing entries");
                let bytes = self.encode(&request);
                self.phase = SyncPhase::Exchange;
                (bytes, true)
            }
            SyncPhase::Exchange => {
                let peer_request: TwoPhaseMapState = self.decode().unwrap_or_default();
                let snapshot = self.map.snapshot_from_state(&peer_request);
                debug!(buckets = snapshot.len(), "sending requested entries");
                let bytes = self.encode(&snapshot);
                self.phase = SyncPhase::Merge;
                (bytes, true)
            }
            SyncPhase::Merge => {
                let snapshot: TwoPhaseMapSnapshot<D> =
                    self.decode().unwrap_or_else(TwoPhaseMapSnapshot::empty);
                self.merged = self.map.merge(snapshot);
                debug!(merged = self.merged, "merged peer entries");
                self.phase = SyncPhase::Finished;
                (Vec::new(), false)
            }
            SyncPhase::Finished => (Vec::new(), false),
        }
    }

    /// Buffer the latest inbound message for the next `generate_message`.
    pub fn recv_message(&mut self, msg: Vec<u8>) -> Result<()> {
        if self.phase == SyncPhase::Finished {
            return Err(SyncError::Finished);
        }
        self.peer_msg = Some(msg);
        Ok(())
    }

    /// Close the session: bump the local clock once more.
    pub fn complete(&mut self) {
        self.map.increment_clock();
        self.phase = SyncPhase::Finished;
    }

    /// Decode and encode failures seen so far.
    pub fn failures(&self) -> &[SyncError] {
        &self.failures
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Drain the recorded failures.
    pub fn take_failures(&mut self) -> Vec<SyncError> {
        std::mem::take(&mut self.failures)
    }

    /// Buckets stored by the MERGE phase.
    pub fn merged(&self) -> usize {
        self.merged
    }

    fn decode<T: DeserializeOwned>(&mut self) -> Option<T> {
        let phase = self.phase;
        let Some(bytes) = self.peer_msg.take() else {
            warn!(%phase, "no peer message, treating as empty");
            self.failures.push(SyncError::MissingMessage(phase));
            return None;
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(source) => {
                warn!(%phase, error = %source, "failed to decode peer message, treating as empty");
                self.failures.push(SyncError::Decode { phase, source });
                None
            }
        }
    }

    fn encode<T: Serialize>(&mut self, value: &T) -> Vec<u8> {
        match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(source) => {
                let phase = self.phase;
                warn!(%phase, error = %source, "failed to encode message");
                self.failures.push(SyncError::Encode { phase, source });
                Vec::new()
            }
        }
    }
}

/// Drive two syncers against each other in lockstep until both finish.
/// Returns the number of messages exchanged.
pub fn run_session<K, D>(a: &mut TwoPhaseSyncer<K, D>, b: &mut TwoPhaseSyncer<K, D>) -> usize
where
    K: AsRef<[u8]>,
    D: Clone + Default + Serialize + DeserializeOwned,
{
    let mut messages = 0;
    loop {
        let (to_b, a_more) = a.generate_message();
        let (to_a, b_more) = b.generate_message();
        if !a_more && !b_more {
            break;
        }
        if a_more && b.recv_message(to_b).is_ok() {
            messages += 1;
        }
        if b_more && a.recv_message(to_a).is_ok() {
            messages += 1;
        }
    }
    a.complete();
    b.complete();
    messages
}

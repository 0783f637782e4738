//! Two-Phase Map - insert, delete and re-insert on top of two grow-only maps
//!
//! An "add" map holds the payloads and a "remove" map holds deletion stamps.
//! Both share one logical clock. A key is present iff it has an add bucket
//! and either no remove bucket or an add version ≥ the remove version, so a
//! later re-add resurrects a removed key.
//!
//! Replication is delta-state: peers exchange [`TwoPhaseMapState`] summaries
//! (clocks only), request the keys they are behind on, and ship back a
//! [`TwoPhaseMapSnapshot`] holding just those buckets.

use crate::clock::LogicalClock;
use crate::error::Result;
use crate::gmap::{Bucket, GMap};
use crate::hash::key_hash;
use crate::lattice::Lattice;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Clock summary of a two-phase map: `hash -> version` for both sides, plus
/// `hash -> payload tag` for the add side.
///
/// The tags let two replicas that hold different payloads at the same
/// version find each other; remove buckets carry no payload to disagree on.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwoPhaseMapState {
    pub add_contents: HashMap<u64, u64>,
    pub remove_contents: HashMap<u64, u64>,
    #[serde(default)]
    pub add_digests: HashMap<u64, u64>,
}

impl TwoPhaseMapState {
    /// Keys of `other` that `self` lacks or holds at a strictly lower
    /// version, computed independently for the add and remove tables. An add
    /// key held at the same version is included too when `other`'s payload
    /// tag would win the tie-break.
    ///
    /// The value recorded for each key is the version `self` currently holds
    /// (0 when absent), so the result doubles as a request: "send me what you
    /// have for these keys that is newer than this". Equal-version requests
    /// carry `self`'s tag in `add_digests`.
    pub fn difference(&self, other: &TwoPhaseMapState) -> TwoPhaseMapState {
        let mut add_contents = HashMap::new();
        let mut add_digests = HashMap::new();
        for (hash, their_version) in &other.add_contents {
            let own = self.add_contents.get(hash).copied().unwrap_or(0);
            if own < *their_version {
                add_contents.insert(*hash, own);
            } else if own == *their_version && self.loses_tie(other, *hash) {
                add_contents.insert(*hash, own);
                if let Some(tag) = self.add_digests.get(hash) {
                    add_digests.insert(*hash, *tag);
                }
            }
        }

        TwoPhaseMapState {
            add_contents,
            remove_contents: behind(&self.remove_contents, &other.remove_contents),
            add_digests,
        }
    }

    fn loses_tie(&self, other: &TwoPhaseMapState, hash: u64) -> bool {
        match (self.add_digests.get(&hash), other.add_digests.get(&hash)) {
            (Some(mine), Some(theirs)) => theirs > mine,
            _ => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.add_contents.is_empty() && self.remove_contents.is_empty()
    }

    pub fn len(&self) -> usize {
        self.add_contents.len() + self.remove_contents.len()
    }
}

fn behind(mine: &HashMap<u64, u64>, theirs: &HashMap<u64, u64>) -> HashMap<u64, u64> {
    theirs
        .iter()
        .filter_map(|(hash, their_version)| {
            let own = mine.get(hash).copied().unwrap_or(0);
            (own < *their_version).then_some((*hash, own))
        })
        .collect()
}

/// Bucket payloads for a subset (or all) of a two-phase map's keys.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TwoPhaseMapSnapshot<D> {
    pub add: HashMap<u64, Bucket<D>>,
    pub remove: HashMap<u64, Bucket<bool>>,
}

impl<D> TwoPhaseMapSnapshot<D> {
    pub fn empty() -> Self {
        Self {
            add: HashMap::new(),
            remove: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }

    pub fn len(&self) -> usize {
        self.add.len() + self.remove.len()
    }
}

/// The replicated two-phase map.
pub struct TwoPhaseMap<K, D> {
    add_map: GMap<K, D>,
    remove_map: GMap<K, bool>,
    clock: Arc<LogicalClock>,
    /// First stamp each key was assigned; bookkeeping only
    created: RwLock<HashMap<u64, u64>>,
    /// Buckets stored by merge; catches tie-break replacements that leave
    /// the version sum unchanged
    stored: AtomicU64,
    last_saved: AtomicU64,
    last_saved_stored: AtomicU64,
}

impl<K, D> TwoPhaseMap<K, D>
where
    K: AsRef<[u8]>,
    D: Clone + Default + Serialize,
{
    /// Create an empty map whose clock belongs to `process_id`.
    pub fn new(process_id: u64) -> Self {
        let clock = Arc::new(LogicalClock::new(process_id));
        Self {
            add_map: GMap::new(clock.clone()),
            remove_map: GMap::new(clock.clone()),
            clock,
            created: RwLock::new(HashMap::new()),
            stored: AtomicU64::new(0),
            last_saved: AtomicU64::new(0),
            last_saved_stored: AtomicU64::new(0),
        }
    }

    pub fn clock(&self) -> &Arc<LogicalClock> {
        &self.clock
    }

    /// Bump the shared clock without writing anything.
    pub fn increment_clock(&self) -> u64 {
        self.clock.increment()
    }

    /// Insert or overwrite `key`. Returns the stamp of the write.
    pub fn put(&self, key: &K, value: D) -> u64 {
        let version = self.add_map.put(key, value);
        self.created.write().entry(key_hash(key)).or_insert(version);
        version
    }

    /// Present value of `key` together with its add version.
    pub fn get_versioned(&self, key: &K) -> Option<(u64, D)> {
        let hash = key_hash(key);
        if !self.contains_hash(hash) {
            return None;
        }
        self.add_map.get_bucket(hash).map(|b| (b.version, b.value))
    }

    /// Overwrite `key` only if its add bucket is still at `version`.
    /// Returns the new stamp, or `None` if a concurrent write moved it.
    pub fn put_if_version(&self, key: &K, version: u64, value: D) -> Option<u64> {
        self.add_map.compare_and_put(key, Some(version), value)
    }

    /// Replicated delete of `key`. Returns the stamp of the removal.
    pub fn remove(&self, key: &K) -> u64 {
        self.remove_map.put(key, true)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.contains_hash(key_hash(key))
    }

    pub fn contains_hash(&self, hash: u64) -> bool {
        match (self.add_map.version(hash), self.remove_map.version(hash)) {
            (Some(added), Some(removed)) => added >= removed,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Value for `key` if it is logically present.
    pub fn get(&self, key: &K) -> Option<D> {
        self.get_by_hash(key_hash(key))
    }

    pub fn get_by_hash(&self, hash: u64) -> Option<D> {
        if self.contains_hash(hash) {
            self.add_map.get_by_hash(hash)
        } else {
            None
        }
    }

    /// Locally flag `key` as unreachable. Never replicated.
    pub fn mark(&self, key: &K) {
        self.add_map.mark(key);
    }

    pub fn unmark(&self, key: &K) {
        self.add_map.unmark(key);
    }

    pub fn is_marked(&self, key: &K) -> bool {
        self.add_map.is_marked(key)
    }

    pub fn is_marked_hash(&self, hash: u64) -> bool {
        self.add_map.is_marked_hash(hash)
    }

    /// First stamp recorded for `key`.
    pub fn created_at(&self, key: &K) -> Option<u64> {
        self.created.read().get(&key_hash(key)).copied()
    }

    /// Logically present entries.
    pub fn as_map(&self) -> HashMap<u64, D> {
        let removed = self.remove_map.get_clock();
        self.add_map
            .save()
            .into_iter()
            .filter(|(hash, bucket)| removed.get(hash).map_or(true, |r| bucket.version >= *r))
            .map(|(hash, bucket)| (hash, bucket.value))
            .collect()
    }

    /// Hashes of logically present entries.
    pub fn keys(&self) -> Vec<u64> {
        let removed = self.remove_map.get_clock();
        self.add_map
            .get_clock()
            .into_iter()
            .filter(|(hash, version)| removed.get(hash).map_or(true, |r| version >= r))
            .map(|(hash, _)| hash)
            .collect()
    }

    /// Number of logically present entries.
    pub fn len(&self) -> usize {
        self.keys().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Full `{add, remove}` bucket dump.
    pub fn snapshot(&self) -> TwoPhaseMapSnapshot<D> {
        TwoPhaseMapSnapshot {
            add: self.add_map.save(),
            remove: self.remove_map.save(),
        }
    }

    /// Buckets whose local version is newer than the version recorded for
    /// the same key in `state`, plus add buckets at the same version whose
    /// payload tag beats the one in `state.add_digests`. Keys absent from
    /// `state` are not sent.
    pub fn snapshot_from_state(&self, state: &TwoPhaseMapState) -> TwoPhaseMapSnapshot<D> {
        let mut add_keys = newer_keys(&self.add_map, &state.add_contents);
        add_keys.extend(state.add_digests.iter().filter_map(|(hash, their_tag)| {
            let same_version = state.add_contents.get(hash).copied() == self.add_map.version(*hash);
            let wins = self.add_map.digest(*hash).is_some_and(|tag| tag > *their_tag);
            (same_version && wins).then_some(*hash)
        }));

        TwoPhaseMapSnapshot {
            add: self.add_map.save_with_keys(add_keys),
            remove: self
                .remove_map
                .save_with_keys(newer_keys(&self.remove_map, &state.remove_contents)),
        }
    }

    /// Local clock summary, the first message of a sync session.
    pub fn generate_message(&self) -> TwoPhaseMapState {
        TwoPhaseMapState {
            add_contents: self.add_map.get_clock(),
            remove_contents: self.remove_map.get_clock(),
            add_digests: self.add_map.get_digests(),
        }
    }

    /// Apply every bucket of `snapshot`. Returns how many buckets were stored.
    pub fn merge(&self, snapshot: TwoPhaseMapSnapshot<D>) -> usize {
        {
            let mut created = self.created.write();
            for (hash, bucket) in &snapshot.add {
                let first = created.entry(*hash).or_insert(bucket.version);
                *first = (*first).min(bucket.version);
            }
        }
        let stored = self.add_map.merge(snapshot.add) + self.remove_map.merge(snapshot.remove);
        self.stored.fetch_add(stored as u64, Ordering::AcqRel);
        stored
    }

    /// Cumulative version sum of both maps.
    pub fn get_hash(&self) -> u64 {
        self.add_map.get_hash().wrapping_add(self.remove_map.get_hash())
    }

    /// True iff the version sum moved, or a merge stored a bucket, since the
    /// last [`TwoPhaseMap::save_changes`].
    pub fn has_changes(&self) -> bool {
        self.get_hash() != self.last_saved.load(Ordering::Acquire)
            || self.stored.load(Ordering::Acquire) != self.last_saved_stored.load(Ordering::Acquire)
    }

    pub fn save_changes(&self) {
        self.last_saved_stored
            .store(self.stored.load(Ordering::Acquire), Ordering::Release);
        self.last_saved.store(self.get_hash(), Ordering::Release);
    }

    /// Erase keys whose clock stamp is a low outlier from both maps.
    pub fn prune(&self, deviations: f64) -> Vec<u64> {
        let stale = self.clock.stale_keys(deviations);
        if stale.is_empty() {
            return stale;
        }

        self.add_map.purge(&stale);
        self.remove_map.purge(&stale);
        self.clock.remove(&stale);
        let mut created = self.created.write();
        for hash in &stale {
            created.remove(hash);
        }
        stale
    }

    /// Serialize the full snapshot for bootstrap transfer.
    pub fn save_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.snapshot())?)
    }

    /// Merge a snapshot produced by [`TwoPhaseMap::save_bytes`].
    pub fn load_bytes(&self, bytes: &[u8]) -> Result<usize>
    where
        D: DeserializeOwned,
    {
        let snapshot: TwoPhaseMapSnapshot<D> = serde_json::from_slice(bytes)?;
        Ok(self.merge(snapshot))
    }
}

fn newer_keys<K, D>(map: &GMap<K, D>, requested: &HashMap<u64, u64>) -> Vec<u64>
where
    K: AsRef<[u8]>,
    D: Clone + Default + Serialize,
{
    requested
        .iter()
        .filter(|(hash, version)| map.version(**hash).is_some_and(|local| local > **version))
        .map(|(hash, _)| *hash)
        .collect()
}

impl<K, D> Clone for TwoPhaseMap<K, D>
where
    K: AsRef<[u8]>,
    D: Clone + Default + Serialize,
{
    fn clone(&self) -> Self {
        let clock = Arc::new(LogicalClock::from_counters(
            self.clock.process_id(),
            self.clock.counters(),
        ));
        Self {
            add_map: GMap::with_contents(clock.clone(), self.add_map.raw_contents()),
            remove_map: GMap::with_contents(clock.clone(), self.remove_map.raw_contents()),
            clock,
            created: RwLock::new(self.created.read().clone()),
            stored: AtomicU64::new(self.stored.load(Ordering::Acquire)),
            last_saved: AtomicU64::new(self.last_saved.load(Ordering::Acquire)),
            last_saved_stored: AtomicU64::new(self.last_saved_stored.load(Ordering::Acquire)),
        }
    }
}

impl<K, D> PartialEq for TwoPhaseMap<K, D>
where
    K: AsRef<[u8]>,
    D: Clone + Default + Serialize + PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        self.snapshot() == other.snapshot()
    }
}

impl<K, D> std::fmt::Debug for TwoPhaseMap<K, D>
where
    D: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwoPhaseMap")
            .field("add_map", &self.add_map)
            .field("remove_map", &self.remove_map)
            .finish()
    }
}

impl<K, D> Lattice for TwoPhaseMap<K, D>
where
    K: AsRef<[u8]>,
    D: Clone + Default + Serialize + PartialEq,
{
    fn bottom() -> Self {
        Self::new(0)
    }

    fn join(&self, other: &Self) -> Self {
        let joined = self.clone();
        joined.merge(other.snapshot());
        joined
    }
}

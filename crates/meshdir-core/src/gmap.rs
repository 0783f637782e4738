//! Grow-only Map - buckets are only ever superseded, never deleted by merge.
//!
//! Every write is stamped with the shared [`LogicalClock`]. A bucket learned
//! from a peer replaces the local one only when its version is strictly
//! greater (last-writer-wins). Equal versions with different payloads are
//! resolved by comparing payload digests so that every replica picks the
//! same winner.

use crate::clock::LogicalClock;
use crate::hash::{key_hash, payload_digest, payload_tag};
use crate::lattice::Lattice;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

/// A versioned value stored under a hashed key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket<D> {
    /// Logical clock stamp at the time of the write
    pub version: u64,
    /// The stored value
    pub value: D,
    /// Local "unreachable" annotation, never replicated
    #[serde(default)]
    pub tombstone: bool,
}

impl<D> Bucket<D> {
    pub fn new(version: u64, value: D) -> Self {
        Self {
            version,
            value,
            tombstone: false,
        }
    }
}

/// Grow-only map from `hash(K)` to [`Bucket<D>`].
///
/// `D` must serialize deterministically (no `HashMap` fields) because its
/// serialized digest is the tie-break for equal versions.
pub struct GMap<K, D> {
    contents: RwLock<HashMap<u64, Bucket<D>>>,
    clock: Arc<LogicalClock>,
    _key: PhantomData<fn(K)>,
}

impl<K, D> GMap<K, D>
where
    K: AsRef<[u8]>,
    D: Clone + Default + Serialize,
{
    /// Create an empty map stamped by `clock`.
    pub fn new(clock: Arc<LogicalClock>) -> Self {
        Self::with_contents(clock, HashMap::new())
    }

    pub(crate) fn with_contents(clock: Arc<LogicalClock>, contents: HashMap<u64, Bucket<D>>) -> Self {
        Self {
            contents: RwLock::new(contents),
            clock,
            _key: PhantomData,
        }
    }

    /// The clock stamping this map's writes.
    pub fn clock(&self) -> &Arc<LogicalClock> {
        &self.clock
    }

    /// Stamp `value` with a fresh clock value and store it. Returns the stamp.
    pub fn put(&self, key: &K, value: D) -> u64 {
        let hash = key_hash(key);
        let version = self.clock.increment();
        self.contents.write().insert(hash, Bucket::new(version, value));
        self.clock.put(hash, version);
        version
    }

    /// Like [`GMap::put`], but only if the bucket under `key` still carries
    /// `expected` (`None` meaning absent). Returns the new stamp, or `None`
    /// when another write got there first.
    pub fn compare_and_put(&self, key: &K, expected: Option<u64>, value: D) -> Option<u64> {
        let hash = key_hash(key);
        let version = {
            let mut contents = self.contents.write();
            if contents.get(&hash).map(|b| b.version) != expected {
                return None;
            }
            let version = self.clock.increment();
            contents.insert(hash, Bucket::new(version, value));
            version
        };
        self.clock.put(hash, version);
        Some(version)
    }

    /// Version-gated write used during merge. Returns true if the bucket was
    /// stored.
    pub fn put_bucket(&self, hash: u64, bucket: Bucket<D>) -> bool {
        let version = bucket.version;
        let stored = {
            let mut contents = self.contents.write();
            let wins = match contents.get(&hash) {
                None => true,
                Some(existing) if bucket.version > existing.version => true,
                Some(existing) if bucket.version == existing.version => {
                    tie_break_wins(&bucket.value, &existing.value)
                }
                Some(_) => false,
            };

            if wins {
                let tombstone = contents
                    .get(&hash)
                    .is_some_and(|existing| existing.version == version && existing.tombstone);
                contents.insert(
                    hash,
                    Bucket {
                        version,
                        value: bucket.value,
                        tombstone,
                    },
                );
            }
            wins
        };

        self.clock.put(hash, version);
        stored
    }

    /// Apply every bucket with [`GMap::put_bucket`].
    pub fn merge(&self, buckets: HashMap<u64, Bucket<D>>) -> usize {
        let mut stored = 0;
        for (hash, bucket) in buckets {
            if self.put_bucket(hash, bucket) {
                stored += 1;
            }
        }
        stored
    }

    /// Value stored for `key`, or `D::default()` when absent.
    pub fn get(&self, key: &K) -> D {
        self.get_by_hash(key_hash(key)).unwrap_or_default()
    }

    pub fn get_by_hash(&self, hash: u64) -> Option<D> {
        self.contents.read().get(&hash).map(|b| b.value.clone())
    }

    pub fn get_bucket(&self, hash: u64) -> Option<Bucket<D>> {
        self.contents.read().get(&hash).cloned()
    }

    /// Version stored under `hash`, without cloning the payload.
    pub fn version(&self, hash: u64) -> Option<u64> {
        self.contents.read().get(&hash).map(|b| b.version)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.contains_hash(key_hash(key))
    }

    pub fn contains_hash(&self, hash: u64) -> bool {
        self.contents.read().contains_key(&hash)
    }

    /// Flag the bucket as unreachable without bumping its version.
    pub fn mark(&self, key: &K) {
        self.set_tombstone(key_hash(key), true);
    }

    /// Clear a local mark.
    pub fn unmark(&self, key: &K) {
        self.set_tombstone(key_hash(key), false);
    }

    pub fn is_marked(&self, key: &K) -> bool {
        self.is_marked_hash(key_hash(key))
    }

    pub fn is_marked_hash(&self, hash: u64) -> bool {
        self.contents.read().get(&hash).is_some_and(|b| b.tombstone)
    }

    fn set_tombstone(&self, hash: u64, tombstone: bool) {
        if let Some(bucket) = self.contents.write().get_mut(&hash) {
            bucket.tombstone = tombstone;
        }
    }

    /// Every bucket, with local marks cleared.
    pub fn save(&self) -> HashMap<u64, Bucket<D>> {
        self.contents
            .read()
            .iter()
            .map(|(hash, bucket)| (*hash, unmarked(bucket)))
            .collect()
    }

    /// Buckets for the requested hashes only, with local marks cleared.
    pub fn save_with_keys(&self, keys: impl IntoIterator<Item = u64>) -> HashMap<u64, Bucket<D>> {
        let contents = self.contents.read();
        keys.into_iter()
            .filter_map(|hash| contents.get(&hash).map(|b| (hash, unmarked(b))))
            .collect()
    }

    /// `hash -> version` summary, no payloads.
    pub fn get_clock(&self) -> HashMap<u64, u64> {
        self.contents
            .read()
            .iter()
            .map(|(hash, bucket)| (*hash, bucket.version))
            .collect()
    }

    /// `hash -> payload tag` summary, used to spot equal-version conflicts.
    pub fn get_digests(&self) -> HashMap<u64, u64> {
        self.contents
            .read()
            .iter()
            .filter_map(|(hash, bucket)| value_tag(&bucket.value).map(|tag| (*hash, tag)))
            .collect()
    }

    /// Payload tag of the bucket stored under `hash`.
    pub fn digest(&self, hash: u64) -> Option<u64> {
        self.contents.read().get(&hash).and_then(|b| value_tag(&b.value))
    }

    /// Sum of all bucket versions: a cheap "did anything change" oracle.
    pub fn get_hash(&self) -> u64 {
        self.contents
            .read()
            .values()
            .fold(0u64, |acc, b| acc.wrapping_add(b.version))
    }

    /// Delete the buckets stored under `hashes`. Returns how many went away.
    pub fn purge(&self, hashes: &[u64]) -> usize {
        let mut contents = self.contents.write();
        hashes.iter().filter(|h| contents.remove(h).is_some()).count()
    }

    /// Delete buckets the clock reports as stale. Returns the stale hashes.
    pub fn prune(&self, deviations: f64) -> Vec<u64> {
        let stale = self.clock.stale_keys(deviations);
        self.purge(&stale);
        stale
    }

    pub fn keys(&self) -> Vec<u64> {
        self.contents.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.contents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contents.read().is_empty()
    }

    pub(crate) fn raw_contents(&self) -> HashMap<u64, Bucket<D>> {
        self.contents.read().clone()
    }
}

fn unmarked<D: Clone>(bucket: &Bucket<D>) -> Bucket<D> {
    Bucket {
        version: bucket.version,
        value: bucket.value.clone(),
        tombstone: false,
    }
}

fn value_tag<D: Serialize>(value: &D) -> Option<u64> {
    serde_json::to_vec(value).ok().map(|bytes| payload_tag(&bytes))
}

/// Deterministic winner between two payloads that carry the same version.
fn tie_break_wins<D: Serialize>(incoming: &D, existing: &D) -> bool {
    match (serde_json::to_vec(incoming), serde_json::to_vec(existing)) {
        (Ok(a), Ok(b)) => payload_digest(&a) > payload_digest(&b),
        _ => false,
    }
}

impl<K, D> Clone for GMap<K, D>
where
    K: AsRef<[u8]>,
    D: Clone + Default + Serialize,
{
    fn clone(&self) -> Self {
        let clock = Arc::new(LogicalClock::from_counters(
            self.clock.process_id(),
            self.clock.counters(),
        ));
        Self::with_contents(clock, self.raw_contents())
    }
}

impl<K, D> PartialEq for GMap<K, D>
where
    K: AsRef<[u8]>,
    D: Clone + Default + Serialize + PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        self.save() == other.save()
    }
}

impl<K, D> std::fmt::Debug for GMap<K, D>
where
    D: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GMap")
            .field("contents", &*self.contents.read())
            .finish()
    }
}

impl<K, D> Lattice for GMap<K, D>
where
    K: AsRef<[u8]>,
    D: Clone + Default + Serialize + PartialEq,
{
    fn bottom() -> Self {
        Self::new(Arc::new(LogicalClock::new(0)))
    }

    fn join(&self, other: &Self) -> Self {
        let joined = self.clone();
        joined.merge(other.save());
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_map() -> GMap<String, String> {
        GMap::new(Arc::new(LogicalClock::new(1)))
    }

    #[test]
    fn test_put_and_get() {
        let map = new_map();
        map.put(&"a".to_string(), "alpha".to_string());

        assert!(map.contains(&"a".to_string()));
        assert_eq!(map.get(&"a".to_string()), "alpha");
    }

    #[test]
    fn test_get_missing_returns_default() {
        let map = new_map();
        assert_eq!(map.get(&"missing".to_string()), String::new());
        assert!(!map.contains(&"missing".to_string()));
    }

    #[test]
    fn test_later_put_wins() {
        let map = new_map();
        let key = "k".to_string();
        let v1 = map.put(&key, "v1".to_string());
        let v2 = map.put(&key, "v2".to_string());

        assert!(v2 > v1);
        assert_eq!(map.get(&key), "v2");
    }

    #[test]
    fn test_put_bucket_discards_older_versions() {
        let map = new_map();
        let hash = key_hash("k");

        assert!(map.put_bucket(hash, Bucket::new(5, "new".to_string())));
        assert!(!map.put_bucket(hash, Bucket::new(3, "old".to_string())));
        assert_eq!(map.get_by_hash(hash), Some("new".to_string()));
    }

    #[test]
    fn test_put_bucket_raises_clock() {
        let map = new_map();
        map.put_bucket(key_hash("k"), Bucket::new(40, "v".to_string()));
        assert_eq!(map.clock().increment(), 41);
    }

    #[test]
    fn test_equal_version_tie_break_is_order_independent() {
        let hash = key_hash("k");
        let left = new_map();
        left.put_bucket(hash, Bucket::new(7, "x".to_string()));
        left.put_bucket(hash, Bucket::new(7, "y".to_string()));

        let right = new_map();
        right.put_bucket(hash, Bucket::new(7, "y".to_string()));
        right.put_bucket(hash, Bucket::new(7, "x".to_string()));

        assert_eq!(left.get_by_hash(hash), right.get_by_hash(hash));
    }

    #[test]
    fn test_mark_does_not_bump_version() {
        let map = new_map();
        let key = "k".to_string();
        let version = map.put(&key, "v".to_string());

        map.mark(&key);
        assert!(map.is_marked(&key));
        assert_eq!(map.get_clock()[&key_hash(&key)], version);

        map.unmark(&key);
        assert!(!map.is_marked(&key));
    }

    #[test]
    fn test_save_clears_marks() {
        let map = new_map();
        let key = "k".to_string();
        map.put(&key, "v".to_string());
        map.mark(&key);

        let saved = map.save();
        assert!(!saved[&key_hash(&key)].tombstone);
        assert!(map.is_marked(&key));
    }

    #[test]
    fn test_save_with_keys_returns_subset() {
        let map = new_map();
        map.put(&"a".to_string(), "1".to_string());
        map.put(&"b".to_string(), "2".to_string());

        let saved = map.save_with_keys([key_hash("a"), key_hash("missing")]);
        assert_eq!(saved.len(), 1);
        assert!(saved.contains_key(&key_hash("a")));
    }

    #[test]
    fn test_get_hash_sums_versions() {
        let map = new_map();
        let v1 = map.put(&"a".to_string(), "1".to_string());
        let v2 = map.put(&"b".to_string(), "2".to_string());
        assert_eq!(map.get_hash(), v1 + v2);
    }

    #[test]
    fn test_purge_removes_buckets() {
        let map = new_map();
        map.put(&"a".to_string(), "1".to_string());
        assert_eq!(map.purge(&[key_hash("a"), key_hash("b")]), 1);
        assert!(map.is_empty());
    }

    #[test]
    fn test_join_is_idempotent() {
        let map = new_map();
        map.put(&"a".to_string(), "1".to_string());
        assert_eq!(map.join(&map), map);
    }
}

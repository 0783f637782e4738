//! Cluster partitioning of the peer set.
//!
//! Peers are sorted by id and cut into aligned bands of `cluster_size`. A
//! node gossips mostly inside its own band and occasionally jumps to a
//! node in another band so updates cross band boundaries in a logarithmic
//! number of hops.
//!
//! ```text
//! sorted: a b c d e f g h      cluster_size = 2
//! bands: [a b][c d][e f][g h]
//! inter-cluster from c (i = 2): (2*i + r*2) mod 8, r in {1, 2}
//! ```

use crate::error::{Result, SdkError};
use rand::Rng;

/// Deterministic band partitioner.
#[derive(Clone, Debug)]
pub struct ConnectionClusterer {
    cluster_size: usize,
}

impl ConnectionClusterer {
    /// Fails unless `cluster_size` is a power of two.
    pub fn new(cluster_size: usize) -> Result<Self> {
        if !cluster_size.is_power_of_two() {
            return Err(SdkError::InvalidConfig(format!(
                "cluster size must be a power of two, got {}",
                cluster_size
            )));
        }
        Ok(Self { cluster_size })
    }

    pub fn cluster_size(&self) -> usize {
        self.cluster_size
    }

    /// The band of `min(cluster_size, N)` consecutive sorted ids that
    /// `self_id` falls in. The last band is shifted back so it is never
    /// short.
    pub fn get_neighbours(&self, global: &[String], self_id: &str) -> Vec<String> {
        let sorted = sorted_ids(global);
        let (start, end) = self.band(sorted.len(), position(&sorted, self_id));
        sorted[start..end].to_vec()
    }

    /// A contact outside `self_id`'s band, picked with a binary-heap style
    /// jump. Always outside the band when `N >= 2 * cluster_size`.
    pub fn get_inter_cluster<R: Rng + ?Sized>(
        &self,
        global: &[String],
        self_id: &str,
        rng: &mut R,
    ) -> Option<String> {
        let sorted = sorted_ids(global);
        let n = sorted.len();
        if n <= self.cluster_size {
            return None;
        }

        let pos = position(&sorted, self_id);
        let (start, end) = self.band(n, pos);
        let r: usize = rng.gen_range(1..=2);

        let mut target = (2 * pos + r * self.cluster_size) % n;
        if (start..end).contains(&target) {
            target = (end + (target - start)) % n;
        }
        Some(sorted[target].clone())
    }

    fn band(&self, n: usize, pos: usize) -> (usize, usize) {
        let size = self.cluster_size.min(n);
        let start = ((pos / self.cluster_size) * self.cluster_size).min(n - size);
        (start, start + size)
    }
}

fn sorted_ids(global: &[String]) -> Vec<String> {
    let mut sorted = global.to_vec();
    sorted.sort();
    sorted.dedup();
    sorted
}

/// Index `self_id` occupies, or would occupy, in `sorted`.
fn position(sorted: &[String], self_id: &str) -> usize {
    match sorted.binary_search_by(|id| id.as_str().cmp(self_id)) {
        Ok(i) | Err(i) => i,
    }
}

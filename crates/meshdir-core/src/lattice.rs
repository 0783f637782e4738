//! Merge algebra shared by the directory stores.
//!
//! Replicas converge because merging is a join: order, grouping and
//! repetition of merges never change the result. [`GMap`](crate::gmap::GMap)
//! and [`TwoPhaseMap`](crate::twophase::TwoPhaseMap) both implement
//! [`Lattice`], and `tests/properties.rs` checks the laws against them.

/// A store whose full-state merge is a join.
pub trait Lattice: Clone + PartialEq {
    /// An empty replica; merging it changes nothing.
    fn bottom() -> Self;

    /// Both replicas merged, leaving the inputs untouched.
    fn join(&self, other: &Self) -> Self;

    /// True iff `self` already holds everything in `other`.
    fn covers(&self, other: &Self) -> bool {
        &self.join(other) == self
    }

    /// Merge `other` into `self` in place.
    fn absorb(&mut self, other: &Self) {
        *self = self.join(other);
    }
}

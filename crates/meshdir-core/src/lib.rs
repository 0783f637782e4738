// File: `crates/meshdir-core/src/lib.rs`
pub mod clock;
pub mod error;
pub mod gmap;
pub mod hash;
pub mod lattice;
pub mod twophase;

pub use clock::LogicalClock;
pub use error::{CoreError, Result};
pub use gmap::{Bucket, GMap};
pub use hash::key_hash;
pub use lattice::Lattice;
pub use twophase::{TwoPhaseMap, TwoPhaseMapSnapshot, TwoPhaseMapState};

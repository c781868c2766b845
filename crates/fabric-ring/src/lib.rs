//! fabric-ring: deterministic partitioning of the controller key space.
//!
//! Pure functions only: the same set of instance keys always yields the
//! same tiling, on every instance, without coordination.
//!
//! # Components
//!
//! - **`partitioner`**: key assignment for joiners, owned ranges, the `Ring` view
//! - **`hash`**: stable hash of workload object IDs onto the ring
//!
//! # Key assignment
//!
//! The first instance of a controller type takes `i64::MAX` (the anchor).
//! Each later joiner bisects the lowest range: it takes `min / 2`, so it
//! carves the low half off the current smallest-key holder and leaves
//! every other range untouched.

pub mod error;
pub mod hash;
pub mod partitioner;

pub use error::{RingError, RingResult};
pub use hash::workload_hash;
pub use partitioner::{Ring, assign_new_key, owned_range, verify_tiling};

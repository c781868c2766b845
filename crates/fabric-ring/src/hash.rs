//! Workload hashing onto the ring.

use fabric_core::MAX_CONTROLLER_KEY;
use sha2::{Digest, Sha256};

/// Hash a workload object ID into `[1, i64::MAX]`.
///
/// SHA-256 based, so every process and every release agrees on where an
/// object lands.
pub fn workload_hash(object_id: &str) -> i64 {
    let digest = Sha256::digest(object_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let raw = u64::from_be_bytes(prefix);
    ((raw % MAX_CONTROLLER_KEY as u64) + 1) as i64
}

//! Ring partitioner: key assignment and owned ranges.
//!
//! An instance with key `k` owns `(prev, k]`, where `prev` is the next
//! smaller key on the ring (or 0). The highest key also owns everything
//! above it up to `i64::MAX`; while the anchor is alive that is a no-op,
//! and once the anchor is gone it keeps the top of the ring owned.

use std::collections::BTreeSet;

use fabric_core::{ControllerInstance, KeyRange, MAX_CONTROLLER_KEY};
use tracing::debug;

use crate::error::{RingError, RingResult};

/// Pick the key for a newly joining instance.
///
/// Empty ring → `i64::MAX`. Otherwise half of the current minimum, which
/// is strictly below every existing key and splits only the lowest range.
pub fn assign_new_key(existing: &BTreeSet<i64>) -> RingResult<i64> {
    if let Some(&lowest) = existing.first() {
        check_key(lowest)?;
    }
    bisect_lowest(existing.first().copied())
}

fn bisect_lowest(lowest: Option<i64>) -> RingResult<i64> {
    match lowest {
        None => Ok(MAX_CONTROLLER_KEY),
        Some(lowest) => {
            let key = lowest / 2;
            if key <= 0 {
                return Err(RingError::KeySpaceExhausted { lowest });
            }
            debug!(lowest, key, "bisected lowest ring range");
            Ok(key)
        }
    }
}

/// Range owned by `key` given every key on the ring in ascending order.
pub fn owned_range(key: i64, sorted_keys: &[i64]) -> RingResult<KeyRange> {
    if let Some(pair) = sorted_keys.windows(2).find(|w| w[0] >= w[1]) {
        return Err(if pair[0] == pair[1] {
            RingError::DuplicateKey(pair[0])
        } else {
            RingError::NotSorted
        });
    }
    if let Some(&lowest) = sorted_keys.first() {
        check_key(lowest)?;
    }
    let idx = sorted_keys
        .binary_search(&key)
        .map_err(|_| RingError::UnknownKey(key))?;

    let lower = if idx == 0 { 0 } else { sorted_keys[idx - 1] };
    let upper = if idx + 1 == sorted_keys.len() {
        MAX_CONTROLLER_KEY
    } else {
        key
    };
    Ok(KeyRange::new(lower, upper))
}

/// Check that `ranges` cover `(0, i64::MAX]` exactly once.
pub fn verify_tiling(ranges: &[KeyRange]) -> RingResult<()> {
    let mut sorted: Vec<KeyRange> = ranges.to_vec();
    sorted.sort_by_key(|r| r.lower_exclusive);

    let mut cursor = 0i64;
    for range in &sorted {
        if range.is_empty() {
            return Err(RingError::TilingViolation(format!("empty range {range}")));
        }
        if range.lower_exclusive != cursor {
            return Err(RingError::TilingViolation(format!(
                "expected a range starting at {cursor}, found {range}"
            )));
        }
        cursor = range.upper_inclusive;
    }
    if cursor != MAX_CONTROLLER_KEY {
        return Err(RingError::TilingViolation(format!(
            "key space ends at {cursor}, not at {MAX_CONTROLLER_KEY}"
        )));
    }
    Ok(())
}

fn check_key(key: i64) -> RingResult<()> {
    if key <= 0 {
        return Err(RingError::KeyOutOfRange(key));
    }
    Ok(())
}

/// Sorted, validated view over the keys of one controller type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ring {
    keys: Vec<i64>,
}

impl Ring {
    /// Build a ring. Rejects duplicates and keys outside `(0, i64::MAX]`.
    pub fn new(keys: impl IntoIterator<Item = i64>) -> RingResult<Self> {
        let mut keys: Vec<i64> = keys.into_iter().collect();
        keys.sort_unstable();
        if let Some(pair) = keys.windows(2).find(|w| w[0] == w[1]) {
            return Err(RingError::DuplicateKey(pair[0]));
        }
        if let Some(&lowest) = keys.first() {
            check_key(lowest)?;
        }
        Ok(Self { keys })
    }

    pub fn from_instances<'a>(
        instances: impl IntoIterator<Item = &'a ControllerInstance>,
    ) -> RingResult<Self> {
        Self::new(instances.into_iter().map(|i| i.controller_key))
    }

    /// Keys in ascending order.
    pub fn keys(&self) -> &[i64] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, key: i64) -> bool {
        self.keys.binary_search(&key).is_ok()
    }

    pub fn owned_range(&self, key: i64) -> RingResult<KeyRange> {
        owned_range(key, &self.keys)
    }

    /// Every key with its owned range, ascending.
    pub fn ranges(&self) -> Vec<(i64, KeyRange)> {
        self.keys
            .iter()
            .map(|&k| (k, self.owned_range(k).unwrap_or(KeyRange::empty_at(k))))
            .collect()
    }

    /// Key of the instance owning `hash`, if any instance is registered.
    pub fn owner_of(&self, hash: i64) -> Option<i64> {
        if hash <= 0 {
            return None;
        }
        let idx = self.keys.partition_point(|&k| k < hash);
        self.keys.get(idx).or_else(|| self.keys.last()).copied()
    }

    /// The next-higher key, i.e. the instance a joiner at `key` takes from.
    pub fn successor(&self, key: i64) -> Option<i64> {
        let idx = self.keys.partition_point(|&k| k <= key);
        self.keys.get(idx).copied()
    }

    /// Key a new instance would get on this ring.
    pub fn next_key(&self) -> RingResult<i64> {
        bisect_lowest(self.keys.first().copied())
    }
}

//! Partition-aware filter: decides which workload objects this instance owns.
//!
//! Workers call [`PartitionFilter::contains`] (snapshot read) or
//! [`PartitionFilter::begin`] (claim and track) for every object they see.
//! The coordination loop swaps the served range underneath them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use fabric_core::KeyRange;
use fabric_ring::workload_hash;
use tokio::sync::{Notify, watch};
use tracing::debug;

/// Served range plus the hashes of items currently being processed.
///
/// Range swaps and claims serialize on the in-flight lock, so a claim
/// either sees the old range and is counted before a shrink is decided,
/// or sees the new range. Plain `contains` reads never block.
pub struct PartitionFilter {
    range: watch::Sender<KeyRange>,
    inflight: Mutex<BTreeMap<i64, usize>>,
    finished: Notify,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl PartitionFilter {
    /// A filter that serves nothing.
    pub fn new() -> Self {
        let (range, _) = watch::channel(KeyRange::empty_at(0));
        Self {
            range,
            inflight: Mutex::new(BTreeMap::new()),
            finished: Notify::new(),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Current served range.
    pub fn range(&self) -> KeyRange {
        *self.range.borrow()
    }

    /// Whether the object's hash lies in the served range.
    pub fn contains(&self, object_id: &str) -> bool {
        self.contains_hash(workload_hash(object_id))
    }

    pub fn contains_hash(&self, hash: i64) -> bool {
        self.range.borrow().contains(hash)
    }

    /// Claim an object for processing. `None` if it is not owned.
    ///
    /// The item counts as in flight until the guard is dropped; a pending
    /// handoff waits for it.
    pub fn begin(&self, object_id: &str) -> Option<WorkGuard<'_>> {
        let hash = workload_hash(object_id);
        let mut inflight = self.lock_inflight();
        if !self.range.borrow().contains(hash) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        *inflight.entry(hash).or_insert(0) += 1;
        self.accepted.fetch_add(1, Ordering::Relaxed);
        Some(WorkGuard { filter: self, hash })
    }

    /// Replace the served range unconditionally.
    pub fn update_range(&self, range: KeyRange) {
        let _inflight = self.lock_inflight();
        let old = self.range.send_replace(range);
        if old != range {
            debug!(%old, new = %range, "filter range replaced");
        }
    }

    /// Shrink to `target` only if nothing in flight lies outside it.
    pub fn release_to(&self, target: KeyRange) -> bool {
        let inflight = self.lock_inflight();
        if inflight.keys().any(|h| !target.contains(*h)) {
            return false;
        }
        let old = self.range.send_replace(target);
        debug!(%old, new = %target, "filter range released");
        true
    }

    /// Whether any in-flight item lies outside `target`.
    pub fn has_inflight_outside(&self, target: &KeyRange) -> bool {
        self.lock_inflight().keys().any(|h| !target.contains(*h))
    }

    /// Number of items currently claimed.
    pub fn inflight(&self) -> usize {
        self.lock_inflight().values().sum()
    }

    /// Resolves once an in-flight item has finished since the last wait.
    pub async fn item_finished(&self) {
        self.finished.notified().await;
    }

    /// Notified on every range change.
    pub fn subscribe(&self) -> watch::Receiver<KeyRange> {
        self.range.subscribe()
    }

    /// (accepted, rejected) claim counts (for diagnostics).
    pub fn claim_counts(&self) -> (u64, u64) {
        (
            self.accepted.load(Ordering::Relaxed),
            self.rejected.load(Ordering::Relaxed),
        )
    }

    fn lock_inflight(&self) -> MutexGuard<'_, BTreeMap<i64, usize>> {
        self.inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn finish(&self, hash: i64) {
        let mut inflight = self.lock_inflight();
        if let Some(count) = inflight.get_mut(&hash) {
            *count -= 1;
            if *count == 0 {
                inflight.remove(&hash);
                self.finished.notify_one();
            }
        }
    }
}

impl Default for PartitionFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// An owned workload item being processed. Dropping it ends the claim.
pub struct WorkGuard<'a> {
    filter: &'a PartitionFilter,
    hash: i64,
}

impl WorkGuard<'_> {
    pub fn hash(&self) -> i64 {
        self.hash
    }
}

impl Drop for WorkGuard<'_> {
    fn drop(&mut self) {
        self.filter.finish(self.hash);
    }
}

//! Domain types for controller-instance coordination.
//!
//! Every controller type has its own ring over the key space
//! `(0, i64::MAX]`. A live controller instance sits at one point of that
//! ring (its `controller_key`) and owns a half-open slice of it,
//! expressed as a [`KeyRange`]. All types serialize to camelCase JSON,
//! which is the shape operators and peers observe in the registry.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Key held by the first instance of a controller type (the ring anchor).
pub const MAX_CONTROLLER_KEY: i64 = i64::MAX;

/// Controller type used when nothing else is configured.
pub const DEFAULT_CONTROLLER_TYPE: &str = "replicaset";

// ── Key ranges ─────────────────────────────────────────────────────

/// Half-open interval `(lower_exclusive, upper_inclusive]` on the ring.
///
/// A range is empty when `lower_exclusive >= upper_inclusive`. Empty
/// ranges are kept canonical as `(p, p]` so they compare equal to the
/// "serves nothing yet" value of a freshly registered instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRange {
    pub lower_exclusive: i64,
    pub upper_inclusive: i64,
}

impl KeyRange {
    /// The whole key space.
    pub const FULL: KeyRange = KeyRange {
        lower_exclusive: 0,
        upper_inclusive: MAX_CONTROLLER_KEY,
    };

    pub fn new(lower_exclusive: i64, upper_inclusive: i64) -> Self {
        Self {
            lower_exclusive,
            upper_inclusive,
        }
    }

    /// The empty range anchored at `point`.
    pub fn empty_at(point: i64) -> Self {
        Self::new(point, point)
    }

    pub fn is_empty(&self) -> bool {
        self.lower_exclusive >= self.upper_inclusive
    }

    /// Whether a hashed workload key falls inside this range.
    pub fn contains(&self, point: i64) -> bool {
        self.lower_exclusive < point && point <= self.upper_inclusive
    }

    /// Whether every point of `other` is also in `self`.
    pub fn covers(&self, other: &KeyRange) -> bool {
        other.is_empty()
            || (self.lower_exclusive <= other.lower_exclusive
                && other.upper_inclusive <= self.upper_inclusive)
    }

    pub fn intersection(&self, other: &KeyRange) -> KeyRange {
        let lower = self.lower_exclusive.max(other.lower_exclusive);
        let upper = self.upper_inclusive.min(other.upper_inclusive);
        if lower >= upper {
            KeyRange::empty_at(lower)
        } else {
            KeyRange::new(lower, upper)
        }
    }

    pub fn intersects(&self, other: &KeyRange) -> bool {
        !self.intersection(other).is_empty()
    }

    /// Parts of `self` not covered by `other` (zero, one or two pieces).
    pub fn subtract(&self, other: &KeyRange) -> Vec<KeyRange> {
        if self.is_empty() {
            return Vec::new();
        }
        if !self.intersects(other) {
            return vec![*self];
        }
        let mut pieces = Vec::with_capacity(2);
        if self.lower_exclusive < other.lower_exclusive {
            pieces.push(KeyRange::new(self.lower_exclusive, other.lower_exclusive));
        }
        if other.upper_inclusive < self.upper_inclusive {
            pieces.push(KeyRange::new(other.upper_inclusive, self.upper_inclusive));
        }
        pieces
    }

    /// Number of ring points in the range.
    pub fn width(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            // Both bounds lie in [0, i64::MAX], so the difference cannot overflow.
            (self.upper_inclusive - self.lower_exclusive) as u64
        }
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}]", self.lower_exclusive, self.upper_inclusive)
    }
}

// ── Controller instance ────────────────────────────────────────────

/// Registry record for one running controller instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ControllerInstance {
    /// Unique per process lifetime; never reused across restarts.
    pub name: String,
    /// Ring scope. Instances of different types never share a ring.
    pub controller_type: String,
    /// Position on the ring, assigned once at registration.
    pub controller_key: i64,
    /// Set while the instance drains a range it is handing to a joiner.
    pub is_locked: bool,
    /// Range the instance's filter currently serves.
    pub serving: KeyRange,
    /// Unix timestamp (seconds) of the last lease renewal.
    pub last_heartbeat: u64,
    /// Store-assigned version for optimistic updates.
    #[serde(default)]
    pub resource_version: u64,
}

impl ControllerInstance {
    /// A fresh, unlocked record that serves nothing yet.
    pub fn new(name: &str, controller_type: &str, controller_key: i64) -> Self {
        Self {
            name: name.to_string(),
            controller_type: controller_type.to_string(),
            controller_key,
            is_locked: false,
            serving: KeyRange::empty_at(controller_key),
            last_heartbeat: epoch_secs(),
            resource_version: 0,
        }
    }

    /// Whether this instance holds the anchor key.
    pub fn is_anchor(&self) -> bool {
        self.controller_key == MAX_CONTROLLER_KEY
    }

    /// Whether the lease has not been renewed within `ttl` as of `now`.
    pub fn lease_expired(&self, now: u64, ttl: Duration) -> bool {
        now.saturating_sub(self.last_heartbeat) > ttl.as_secs()
    }
}

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

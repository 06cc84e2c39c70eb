//! Vector clocks for causal ordering of dataset changes.
//!
//! A device only ever increments its own counter. Merging two clocks takes
//! the per-device maximum, which makes merge commutative, associative and
//! idempotent.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::DeviceId;

/// Causal relation between two clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    /// Both clocks have seen exactly the same events.
    Equal,
    /// `self` happened before `other` (other is causally newer).
    Before,
    /// `self` happened after `other` (self is causally newer).
    After,
    /// Both advanced independently; changes may conflict.
    Concurrent,
}

/// A single clock event: the `counter`-th change authored by `device`.
///
/// Every field of every record carries the dot of the write that produced
/// its current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dot {
    /// Device that authored the change.
    pub device: DeviceId,
    /// Value of the author's own counter after the change.
    pub counter: u64,
}

impl Dot {
    /// Create a new dot.
    pub fn new(device: DeviceId, counter: u64) -> Self {
        Self { device, counter }
    }

    /// Deterministic total order: counter first, then device id.
    pub fn total_cmp(&self, other: &Dot) -> Ordering {
        self.counter
            .cmp(&other.counter)
            .then_with(|| self.device.cmp(&other.device))
    }

    /// The larger of two dots under [`Dot::total_cmp`].
    pub fn max_of(a: Dot, b: Dot) -> Dot {
        if a.total_cmp(&b) == Ordering::Less {
            b
        } else {
            a
        }
    }
}

/// Mapping from device id to a monotonically increasing counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<DeviceId, u64>);

impl VectorClock {
    /// Create an empty clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a clock from explicit entries.
    pub fn from_entries<I: IntoIterator<Item = (DeviceId, u64)>>(entries: I) -> Self {
        Self(entries.into_iter().collect())
    }

    /// Counter for `device` (0 when unknown).
    pub fn get(&self, device: &DeviceId) -> u64 {
        self.0.get(device).copied().unwrap_or(0)
    }

    /// Advance `device`'s own counter and return the dot of the new event.
    ///
    /// Callers must only ever pass the local device id.
    pub fn increment(&mut self, device: DeviceId) -> Dot {
        let counter = self.0.entry(device).or_insert(0);
        *counter = counter.saturating_add(1);
        Dot::new(device, *counter)
    }

    /// Per-device maximum of two clocks.
    pub fn merge(&self, other: &VectorClock) -> VectorClock {
        let mut merged = self.clone();
        merged.merge_in(other);
        merged
    }

    /// Merge `other` into `self` in place.
    pub fn merge_in(&mut self, other: &VectorClock) {
        for (device, &counter) in &other.0 {
            let entry = self.0.entry(*device).or_insert(0);
            if counter > *entry {
                *entry = counter;
            }
        }
    }

    /// Whether this clock has already seen the event `dot`.
    pub fn covers(&self, dot: &Dot) -> bool {
        self.get(&dot.device) >= dot.counter
    }

    /// Compare two clocks causally. Missing entries count as zero.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut self_ahead = false;
        let mut other_ahead = false;

        for device in self.0.keys().chain(other.0.keys()) {
            let a = self.get(device);
            let b = other.get(device);
            if a > b {
                self_ahead = true;
            } else if b > a {
                other_ahead = true;
            }
        }

        match (self_ahead, other_ahead) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::After,
            (false, true) => ClockOrdering::Before,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// True when no device has a non-zero counter.
    pub fn is_empty(&self) -> bool {
        self.0.values().all(|&c| c == 0)
    }

    /// Whether both clocks have observed at least one common device's events.
    ///
    /// Two installations that have never exchanged data have disjoint
    /// non-zero entries.
    pub fn shares_history_with(&self, other: &VectorClock) -> bool {
        self.0
            .iter()
            .any(|(device, &counter)| counter > 0 && other.get(device) > 0)
    }

    /// Sum of all counters, a cheap "how much has happened" measure.
    pub fn total_events(&self) -> u64 {
        self.0.values().fold(0u64, |acc, c| acc.saturating_add(*c))
    }

    /// Iterate over `(device, counter)` entries in device order.
    pub fn iter(&self) -> impl Iterator<Item = (&DeviceId, &u64)> {
        self.0.iter()
    }
}

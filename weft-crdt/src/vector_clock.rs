//! Vector clocks: per-device causal counters.
//!
//! Each space a device participates in carries one vector clock. The clock
//! maps every known device to the count of propagatable writes that device
//! has made; comparing two clocks tells the engine whether one replica has
//! simply fallen behind (stale) or whether both edited independently
//! (concurrent). Devices missing from a clock read as zero.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use weft_types::DeviceId;

/// Result of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    /// Every entry of the first clock is >= the second's, at least one strictly.
    Dominates,
    /// Every entry of the second clock is >= the first's, at least one strictly.
    Dominated,
    /// The clocks are identical entry for entry.
    Equal,
    /// Each clock is strictly ahead of the other somewhere.
    Concurrent,
}

/// A vector clock over device identifiers.
///
/// The invariant the engine depends on: a device only ever increments its
/// own entry; entries for other devices move forward exclusively through
/// [`VectorClock::merge`], never backward.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VectorClock {
    clocks: HashMap<DeviceId, u64>,
}

impl VectorClock {
    /// Creates an empty clock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            clocks: HashMap::new(),
        }
    }

    /// Counter for a device, zero when the device is unknown.
    #[must_use]
    pub fn get(&self, device_id: &DeviceId) -> u64 {
        self.clocks.get(device_id).copied().unwrap_or(0)
    }

    /// Iterates over all known devices and their counters.
    pub fn entries(&self) -> impl Iterator<Item = (&DeviceId, &u64)> {
        self.clocks.iter()
    }

    /// Number of devices with a recorded entry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    /// True when no device has written yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }

    /// Advances a device's own entry by one and returns the new counter.
    ///
    /// Called once per local write the engine must propagate.
    pub fn increment(&mut self, device_id: DeviceId) -> u64 {
        let entry = self.clocks.entry(device_id).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Raises a single entry to `counter` if that moves it forward.
    pub fn observe(&mut self, device_id: DeviceId, counter: u64) {
        let entry = self.clocks.entry(device_id).or_insert(0);
        if counter > *entry {
            *entry = counter;
        }
    }

    /// Pointwise maximum with another clock, in place.
    ///
    /// Commutative, associative and idempotent; entries never move backward.
    pub fn merge(&mut self, other: &Self) {
        for (device_id, &counter) in &other.clocks {
            let entry = self.clocks.entry(*device_id).or_insert(0);
            if counter > *entry {
                *entry = counter;
            }
        }
    }

    /// Pointwise maximum with another clock, returning a new clock.
    #[must_use]
    pub fn merged(&self, other: &Self) -> Self {
        let mut result = self.clone();
        result.merge(other);
        result
    }

    /// Four-way causal comparison over the union of device keys.
    #[must_use]
    pub fn compare(&self, other: &Self) -> ClockOrdering {
        let mut self_covers = true; // self >= other everywhere
        let mut other_covers = true; // other >= self everywhere

        let all_devices: HashSet<_> = self
            .clocks
            .keys()
            .chain(other.clocks.keys())
            .copied()
            .collect();

        for device_id in all_devices {
            let ours = self.get(&device_id);
            let theirs = other.get(&device_id);
            if ours < theirs {
                self_covers = false;
            }
            if theirs < ours {
                other_covers = false;
            }
        }

        match (self_covers, other_covers) {
            (true, true) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Dominates,
            (false, true) => ClockOrdering::Dominated,
            (false, false) => ClockOrdering::Concurrent,
        }
    }

    /// True when this clock is at least as advanced as `other` everywhere.
    ///
    /// Covers both `Dominates` and `Equal`; the delta calculator uses this
    /// to decide that a peer already holds a given write.
    #[must_use]
    pub fn dominates(&self, other: &Self) -> bool {
        matches!(
            self.compare(other),
            ClockOrdering::Dominates | ClockOrdering::Equal
        )
    }

    /// True when neither clock dominates the other.
    #[must_use]
    pub fn is_concurrent_with(&self, other: &Self) -> bool {
        self.compare(other) == ClockOrdering::Concurrent
    }
}

impl PartialEq for VectorClock {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == ClockOrdering::Equal
    }
}

impl Eq for VectorClock {}

impl FromIterator<(DeviceId, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (DeviceId, u64)>>(iter: I) -> Self {
        Self {
            clocks: iter.into_iter().collect(),
        }
    }
}

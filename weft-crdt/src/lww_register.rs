//! Last-Writer-Wins register.
//!
//! Holds a single value stamped with the writing device's hybrid timestamp.
//! Merging keeps the later write; exact timestamp ties fall back to the
//! lexically greater device id, so every replica picks the same winner no
//! matter which side runs the comparison.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use weft_types::{DeviceId, HybridTimestamp};

/// A Last-Writer-Wins register for one scalar field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LWWRegister<T> {
    value: T,
    timestamp: HybridTimestamp,
    device_id: DeviceId,
}

impl<T> LWWRegister<T> {
    /// Creates a register holding `value`, stamped now by `device_id`.
    #[must_use]
    pub fn new(value: T, device_id: DeviceId) -> Self {
        Self {
            value,
            timestamp: HybridTimestamp::now(),
            device_id,
        }
    }

    /// Creates a register with an explicit timestamp (replication or tests).
    #[must_use]
    pub fn with_timestamp(value: T, timestamp: HybridTimestamp, device_id: DeviceId) -> Self {
        Self {
            value,
            timestamp,
            device_id,
        }
    }

    /// Current value.
    #[must_use]
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Timestamp of the winning write.
    #[must_use]
    pub fn timestamp(&self) -> HybridTimestamp {
        self.timestamp
    }

    /// Device that performed the winning write.
    #[must_use]
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Overwrites the value locally, ticking the timestamp so the write
    /// orders after the previous one even on a stalled wall clock.
    pub fn set(&mut self, value: T, device_id: DeviceId) {
        self.value = value;
        self.timestamp = self.timestamp.tick();
        self.device_id = device_id;
    }

    /// Applies a write with an explicit stamp; returns true if it won.
    pub fn set_with_timestamp(
        &mut self,
        value: T,
        timestamp: HybridTimestamp,
        device_id: DeviceId,
    ) -> bool {
        if self.loses_to(timestamp, device_id) {
            self.value = value;
            self.timestamp = timestamp;
            self.device_id = device_id;
            true
        } else {
            false
        }
    }

    /// Whether an incoming `(timestamp, device_id)` write beats the current one.
    fn loses_to(&self, timestamp: HybridTimestamp, device_id: DeviceId) -> bool {
        match timestamp.cmp(&self.timestamp) {
            Ordering::Greater => true,
            Ordering::Less => false,
            // Exact tie: lexically greater device id wins on every replica.
            Ordering::Equal => device_id > self.device_id,
        }
    }
}

impl<T: Clone> LWWRegister<T> {
    /// Keeps whichever side holds the winning write.
    ///
    /// Commutative, associative and idempotent, like every merge in this
    /// crate.
    pub fn merge(&mut self, other: &Self) {
        if self.loses_to(other.timestamp, other.device_id) {
            self.value = other.value.clone();
            self.timestamp = other.timestamp;
            self.device_id = other.device_id;
        }
    }

    /// Merge into a new register, leaving both inputs untouched.
    #[must_use]
    pub fn merged(&self, other: &Self) -> Self {
        let mut result = self.clone();
        result.merge(other);
        result
    }
}

impl<T: PartialEq> PartialEq for LWWRegister<T> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value && self.timestamp == other.timestamp
    }
}

impl<T: Eq> Eq for LWWRegister<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(wall: u64) -> HybridTimestamp {
        HybridTimestamp::new(wall, 0)
    }

    #[test]
    fn later_write_wins() {
        let dev = DeviceId::new();
        let mut reg = LWWRegister::with_timestamp("draft", ts(100), dev);
        assert!(reg.set_with_timestamp("final", ts(200), dev));
        assert_eq!(*reg.value(), "final");
    }

    #[test]
    fn earlier_write_is_ignored() {
        let dev = DeviceId::new();
        let mut reg = LWWRegister::with_timestamp("final", ts(200), dev);
        assert!(!reg.set_with_timestamp("stale", ts(100), dev));
        assert_eq!(*reg.value(), "final");
    }

    #[test]
    fn exact_tie_resolves_to_greater_device_on_both_replicas() {
        let dev_a = DeviceId::new();
        let dev_b = DeviceId::new();
        let winner = dev_a.max(dev_b);

        let a = LWWRegister::with_timestamp("from-a", ts(500), dev_a);
        let b = LWWRegister::with_timestamp("from-b", ts(500), dev_b);

        let merged_on_a = a.merged(&b);
        let merged_on_b = b.merged(&a);

        assert_eq!(merged_on_a.value(), merged_on_b.value());
        assert_eq!(merged_on_a.device_id(), winner);
    }

    #[test]
    fn local_set_advances_past_stalled_clock() {
        let dev = DeviceId::new();
        let mut reg = LWWRegister::with_timestamp(1, HybridTimestamp::new(u64::MAX - 1, 0), dev);
        let before = reg.timestamp();
        reg.set(2, dev);
        assert!(reg.timestamp() > before);
    }
}

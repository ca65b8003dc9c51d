//! Hybrid Logical Clock timestamps.
//!
//! A plain wall clock cannot order edits made on two devices whose clocks
//! drift, and a pure logical counter says nothing a human can read. The HLC
//! (Kulkarni et al., "Logical Physical Clocks") keeps both: millisecond wall
//! time plus a logical counter that only advances when the wall clock fails
//! to. The result is monotonic per device and stays close to real time.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

fn wall_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before Unix epoch")
        .as_millis() as u64
}

/// A Hybrid Logical Clock timestamp: `(wall_time ms, logical counter)`.
///
/// Ordering is lexicographic on `(wall_time, logical)`. Two timestamps can
/// compare equal across devices; callers needing a total order break such
/// ties with the writing device's id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HybridTimestamp {
    wall_time: u64,
    logical: u32,
}

impl HybridTimestamp {
    /// Captures the current wall clock with a zeroed logical counter.
    #[must_use]
    pub fn now() -> Self {
        Self {
            wall_time: wall_now_millis(),
            logical: 0,
        }
    }

    /// Builds a timestamp from raw components.
    #[must_use]
    pub const fn new(wall_time: u64, logical: u32) -> Self {
        Self { wall_time, logical }
    }

    /// Milliseconds since the Unix epoch.
    #[must_use]
    pub const fn wall_time(&self) -> u64 {
        self.wall_time
    }

    /// Logical counter component.
    #[must_use]
    pub const fn logical(&self) -> u32 {
        self.logical
    }

    /// Next timestamp for a local event; strictly greater than `self` even
    /// if the wall clock stalled or stepped backwards.
    #[must_use]
    pub fn tick(&self) -> Self {
        let now = wall_now_millis();
        if now > self.wall_time {
            Self {
                wall_time: now,
                logical: 0,
            }
        } else {
            Self {
                wall_time: self.wall_time,
                logical: self.logical.saturating_add(1),
            }
        }
    }

    /// Advances this clock past a timestamp received from another device.
    ///
    /// The result is strictly greater than both `self` and `other`, so a
    /// local write made after observing a remote write always orders after
    /// it.
    #[must_use]
    pub fn receive(&self, other: &Self) -> Self {
        let now = wall_now_millis();
        let max_wall = now.max(self.wall_time).max(other.wall_time);

        let logical = if max_wall == self.wall_time && max_wall == other.wall_time {
            self.logical.max(other.logical).saturating_add(1)
        } else if max_wall == self.wall_time {
            self.logical.saturating_add(1)
        } else if max_wall == other.wall_time {
            other.logical.saturating_add(1)
        } else {
            0
        };

        Self {
            wall_time: max_wall,
            logical,
        }
    }
}

impl Default for HybridTimestamp {
    fn default() -> Self {
        Self::now()
    }
}

impl PartialOrd for HybridTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HybridTimestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.wall_time.cmp(&other.wall_time) {
            Ordering::Equal => self.logical.cmp(&other.logical),
            unequal => unequal,
        }
    }
}

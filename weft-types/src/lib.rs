//! Core identifier and timestamp types for Weft.
//!
//! This crate defines the small, dependency-light vocabulary shared by the
//! sync engine and the application layers sitting on top of it:
//! - Device, space, entity and conflict identifiers (UUID v7)
//! - Hybrid Logical Clock timestamps
//!
//! Everything domain-specific (note bodies, task models, payload schemas)
//! lives above this crate; nothing here performs I/O.

mod ids;
mod timestamp;

pub use ids::{ConflictId, DeviceId, EntityId, SpaceId};
pub use timestamp::HybridTimestamp;

//! Merge primitives for the Weft sync engine.
//!
//! This crate provides the conflict-free data types the engine orders and
//! merges replicated state with:
//!
//! - [`VectorClock`] — per-device causal counters and the four-way
//!   [`ClockOrdering`] comparison
//! - [`LWWRegister<T>`] — Last-Writer-Wins single values
//! - [`ORSet<T>`] — Observed-Remove Set with durable tombstones
//!
//! All merge operations here satisfy the convergence laws:
//! - **Commutative**: merge(a, b) == merge(b, a)
//! - **Associative**: merge(merge(a, b), c) == merge(a, merge(b, c))
//! - **Idempotent**: merge(a, a) == a
//!
//! so replicas reach the same state no matter in which order, or how many
//! times, they exchange deltas. Everything in this crate is pure
//! computation; persistence and networking live in `weft-sync`.

mod lww_register;
mod orset;
mod vector_clock;

pub use lww_register::LWWRegister;
pub use orset::{ORSet, Tag};
pub use vector_clock::{ClockOrdering, VectorClock};

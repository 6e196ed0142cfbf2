//! Consistent hashing ring for deterministic store-node selection.
//!
//! This crate implements a consistent hash ring that maps keys (e-mail
//! addresses) to store node identifiers. Each node owns a fixed number of
//! replica points on a `u128` ring, placed at `blake3("{node_id}:{index}")`.
//! A key belongs to the first replica point at or after `blake3(key)`,
//! wrapping around past the highest point.
//!
//! Adding or removing a node only moves the keys on the arcs that node
//! owns, roughly `1 / node_count` of the key space.

mod error;
mod ring;

pub use error::RingError;
pub use ring::{DEFAULT_REPLICAS, Reassignment, Ring, key_position};

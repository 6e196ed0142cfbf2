//! Membership-set store capability and backends.
//!
//! Every store node exposes two sets of e-mail addresses, "bounced" and
//! "subscribed". This crate defines the [`MembershipStore`] capability for
//! querying them, the backends implementing it, and the [`StorePool`]
//! owning one handle per node:
//!
//! - [`RedisStore`]: remote key-value node queried with `SISMEMBER`.
//! - [`MemoryStore`]: in-process sets backed by a `RwLock<HashMap>`.
//! - [`SlowStore`]: wrapper injecting random latency before each lookup.

mod error;
mod memory_store;
mod pool;
mod redis_store;
mod slow_store;
mod traits;

pub use error::StoreError;
pub use memory_store::MemoryStore;
pub use pool::{Reconciliation, StaticConnector, StorePool};
pub use redis_store::{RedisConnector, RedisStore};
pub use slow_store::SlowStore;
pub use traits::{MembershipSet, MembershipStore, SetKeys, StoreConnector};

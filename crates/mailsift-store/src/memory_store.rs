//! In-memory membership store backend.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use tracing::debug;

use crate::error::StoreError;
use crate::traits::{MembershipSet, MembershipStore};

/// In-memory membership store backed by a `RwLock<HashMap>`.
///
/// Useful for testing and for running a worker without a key-value tier.
#[derive(Default)]
pub struct MemoryStore {
    sets: RwLock<HashMap<MembershipSet, HashSet<String>>>,
}

impl MemoryStore {
    /// Create a store with both sets empty.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with the given members.
    pub fn with_members<B, S>(bounced: B, subscribed: S) -> Self
    where
        B: IntoIterator,
        B::Item: Into<String>,
        S: IntoIterator,
        S::Item: Into<String>,
    {
        let store = Self::new();
        for email in bounced {
            store.insert(MembershipSet::Bounced, email);
        }
        for email in subscribed {
            store.insert(MembershipSet::Subscribed, email);
        }
        store
    }

    /// Add `email` to `set`. Returns `false` if it was already present.
    pub fn insert(&self, set: MembershipSet, email: impl Into<String>) -> bool {
        let email = email.into();
        debug!(%set, %email, "adding member");
        let mut sets = self.sets.write().expect("lock poisoned");
        sets.entry(set).or_default().insert(email)
    }

    /// Remove `email` from `set`. Returns `false` if it was not present.
    pub fn remove(&self, set: MembershipSet, email: &str) -> bool {
        let mut sets = self.sets.write().expect("lock poisoned");
        sets.get_mut(&set).is_some_and(|members| members.remove(email))
    }

    /// Number of members in `set`.
    pub fn len(&self, set: MembershipSet) -> usize {
        let sets = self.sets.read().expect("lock poisoned");
        sets.get(&set).map_or(0, HashSet::len)
    }
}

#[async_trait::async_trait]
impl MembershipStore for MemoryStore {
    async fn is_member(&self, set: MembershipSet, email: &str) -> Result<bool, StoreError> {
        let sets = self.sets.read().expect("lock poisoned");
        Ok(sets.get(&set).is_some_and(|members| members.contains(email)))
    }
}

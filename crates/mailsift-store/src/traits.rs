//! Core traits and types for membership lookups.

use std::fmt;
use std::sync::Arc;

use mailsift_types::{NodeId, StoreSettings};

use crate::error::StoreError;

/// The two address sets every store node holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MembershipSet {
    /// Addresses that bounced.
    Bounced,
    /// Addresses that are subscribed.
    Subscribed,
}

impl fmt::Display for MembershipSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bounced => f.write_str("bounced"),
            Self::Subscribed => f.write_str("subscribed"),
        }
    }
}

/// Names of the sets on a key-value node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetKeys {
    /// Key of the bounced set.
    pub bounced: String,
    /// Key of the subscribed set.
    pub subscribed: String,
}

impl SetKeys {
    /// The key holding `set`.
    pub fn key(&self, set: MembershipSet) -> &str {
        match set {
            MembershipSet::Bounced => &self.bounced,
            MembershipSet::Subscribed => &self.subscribed,
        }
    }
}

impl Default for SetKeys {
    fn default() -> Self {
        Self::from(&StoreSettings::default())
    }
}

impl From<&StoreSettings> for SetKeys {
    fn from(settings: &StoreSettings) -> Self {
        Self {
            bounced: settings.bounced_set.clone(),
            subscribed: settings.subscribed_set.clone(),
        }
    }
}

/// Capability to answer set-membership queries for e-mail addresses.
///
/// Implementations must be `Send + Sync`; one handle is shared by every
/// lookup routed to its node. Lookups are keyed by the exact address string.
#[async_trait::async_trait]
pub trait MembershipStore: Send + Sync {
    /// Whether `email` is a member of `set`.
    async fn is_member(&self, set: MembershipSet, email: &str) -> Result<bool, StoreError>;

    /// Whether `email` is in the bounced set.
    async fn is_bounced(&self, email: &str) -> Result<bool, StoreError> {
        self.is_member(MembershipSet::Bounced, email).await
    }

    /// Whether `email` is in the subscribed set.
    async fn is_subscribed(&self, email: &str) -> Result<bool, StoreError> {
        self.is_member(MembershipSet::Subscribed, email).await
    }

    /// Release any connection held by the handle.
    async fn close(&self) {}
}

/// Opens a handle for a store node, given its identifier.
#[async_trait::async_trait]
pub trait StoreConnector: Send + Sync {
    /// Open (and connect, where applicable) a handle for `node_id`.
    async fn connect(&self, node_id: &NodeId) -> Result<Arc<dyn MembershipStore>, StoreError>;
}

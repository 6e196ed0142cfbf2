//! Per-address classification against the responsible store node.

use std::sync::Arc;
use std::time::Duration;

use mailsift_store::{MembershipSet, MembershipStore, StoreError};
use mailsift_types::{NodeId, Outcome};
use tracing::{debug, warn};

use crate::router::Router;

/// Classifies e-mail addresses by querying the node the ring assigns them.
///
/// The bounced set is always checked first and wins over the subscribed
/// set. A failed or timed-out lookup yields [`Outcome::Error`], never
/// [`Outcome::Valid`]. Opening a node's handle on first use is bounded by
/// the same timeout as each lookup.
#[derive(Clone)]
pub struct Classifier {
    router: Arc<Router>,
    lookup_timeout: Duration,
}

impl Classifier {
    /// Create a classifier bounding each store call by `lookup_timeout`.
    pub fn new(router: Arc<Router>, lookup_timeout: Duration) -> Self {
        Self {
            router,
            lookup_timeout,
        }
    }

    /// The router this classifier reads from.
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Classify one address.
    pub async fn classify(&self, email: &str) -> Outcome {
        let ring = self.router.ring();
        let Some(node) = ring.route(email) else {
            debug!(%email, "no store node for address");
            return Outcome::Unknown;
        };

        let store = match self.open(node).await {
            Ok(store) => store,
            Err(StoreError::UnknownNode(_)) => {
                debug!(%email, %node, "routed node has no pool entry");
                return Outcome::Unknown;
            }
            Err(e) => {
                warn!(%email, %node, error = %e, "store node unavailable");
                return Outcome::Error;
            }
        };

        let outcome = match self.check(node, store.as_ref(), email).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(%email, %node, error = %e, "store lookup failed");
                Outcome::Error
            }
        };
        debug!(%email, %node, %outcome, "classified");
        outcome
    }

    async fn check(
        &self,
        node: &NodeId,
        store: &dyn MembershipStore,
        email: &str,
    ) -> Result<Outcome, StoreError> {
        if self.lookup(node, store, MembershipSet::Bounced, email).await? {
            return Ok(Outcome::Bounced);
        }
        if self.lookup(node, store, MembershipSet::Subscribed, email).await? {
            return Ok(Outcome::Subscribed);
        }
        Ok(Outcome::Valid)
    }

    /// The node's handle. Opening it counts against the lookup timeout.
    async fn open(&self, node: &NodeId) -> Result<Arc<dyn MembershipStore>, StoreError> {
        tokio::time::timeout(self.lookup_timeout, self.router.pool().client_for(node))
            .await
            .map_err(|_| StoreError::Timeout {
                node: node.clone(),
                timeout: self.lookup_timeout,
            })?
    }

    async fn lookup(
        &self,
        node: &NodeId,
        store: &dyn MembershipStore,
        set: MembershipSet,
        email: &str,
    ) -> Result<bool, StoreError> {
        tokio::time::timeout(self.lookup_timeout, store.is_member(set, email))
            .await
            .map_err(|_| StoreError::Timeout {
                node: node.clone(),
                timeout: self.lookup_timeout,
            })?
    }
}

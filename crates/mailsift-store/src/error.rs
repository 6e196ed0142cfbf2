//! Error types for store lookups.

use std::time::Duration;

use mailsift_types::NodeId;

/// Errors that can occur while opening or querying a store node.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The node could not be reached or the connection dropped.
    #[error("store node {node} unreachable: {reason}")]
    Connect {
        /// The node that failed.
        node: NodeId,
        /// Underlying failure.
        reason: String,
    },

    /// The node did not answer within the lookup timeout.
    #[error("store node {node} did not answer within {timeout:?}")]
    Timeout {
        /// The node that stalled.
        node: NodeId,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The node answered with something other than a membership result.
    #[error("protocol error from store node {node}: {reason}")]
    Protocol {
        /// The node that misbehaved.
        node: NodeId,
        /// Description of the malformed response.
        reason: String,
    },

    /// The node identifier is not a usable store address.
    #[error("invalid store node address {node}: {reason}")]
    InvalidAddress {
        /// The rejected identifier.
        node: NodeId,
        /// Why it was rejected.
        reason: String,
    },

    /// The pool holds no handle for this node.
    #[error("store node {0} is not in the pool")]
    UnknownNode(NodeId),
}

impl StoreError {
    /// Whether the error means the node was unreachable or too slow, as
    /// opposed to answering badly.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::Timeout { .. })
    }
}

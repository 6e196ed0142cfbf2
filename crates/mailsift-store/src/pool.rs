//! Per-node store handle pool.
//!
//! [`StorePool`] owns one [`MembershipStore`] handle per known node id.
//! It holds handles only; which node serves which key is the ring's
//! business. Handles are opened through a [`StoreConnector`], either on
//! first use ([`ConnectMode::Lazy`]) or during reconciliation
//! ([`ConnectMode::Eager`]).

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use mailsift_types::{ConnectMode, NodeId};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::traits::{MembershipStore, StoreConnector};

/// Result of reconciling the pool with a target node list.
#[derive(Debug, Default)]
pub struct Reconciliation {
    /// Nodes whose handle was opened during reconciliation.
    pub opened: Vec<NodeId>,
    /// Nodes removed from the pool (their handles were closed).
    pub released: Vec<NodeId>,
    /// Nodes whose eager open failed. They stay known and are retried lazily.
    pub failed: Vec<(NodeId, StoreError)>,
}

#[derive(Default)]
struct PoolState {
    known: BTreeSet<NodeId>,
    handles: HashMap<NodeId, Arc<dyn MembershipStore>>,
}

/// Owns the handle for each known store node.
pub struct StorePool {
    connector: Arc<dyn StoreConnector>,
    mode: ConnectMode,
    /// Known nodes and open handles. Never held across a lazy connect.
    state: Mutex<PoolState>,
}

impl StorePool {
    /// Create an empty pool.
    pub fn new(connector: Arc<dyn StoreConnector>, mode: ConnectMode) -> Self {
        Self {
            connector,
            mode,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Return the handle for `node_id`, opening it on first use.
    ///
    /// Fails with [`StoreError::UnknownNode`] if the node is not in the
    /// pool, or with the connector's error if the handle cannot be opened.
    /// A failed open is not cached; the next call tries again.
    ///
    /// The pool lock is not held while connecting, so a node that is slow
    /// to open never delays lookups on other nodes. If two callers race to
    /// open the same node, the first handle stored wins and the other is
    /// closed.
    pub async fn client_for(&self, node_id: &NodeId) -> Result<Arc<dyn MembershipStore>, StoreError> {
        {
            let state = self.state.lock().await;
            if !state.known.contains(node_id) {
                return Err(StoreError::UnknownNode(node_id.clone()));
            }
            if let Some(handle) = state.handles.get(node_id) {
                return Ok(handle.clone());
            }
        }

        let handle = match self.connector.connect(node_id).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(node = %node_id, error = %e, "failed to open store handle");
                return Err(e);
            }
        };

        // Re-check under the lock: the node may have been released or
        // opened by another caller while this one was connecting.
        let (result, surplus) = {
            let mut state = self.state.lock().await;
            if !state.known.contains(node_id) {
                debug!(node = %node_id, "node left the pool while connecting");
                (Err(StoreError::UnknownNode(node_id.clone())), Some(handle))
            } else if let Some(existing) = state.handles.get(node_id) {
                (Ok(existing.clone()), Some(handle))
            } else {
                debug!(node = %node_id, "opened store handle");
                state.handles.insert(node_id.clone(), handle.clone());
                (Ok(handle), None)
            }
        };
        if let Some(surplus) = surplus {
            surplus.close().await;
        }
        result
    }

    /// Make the pool's node set equal to `nodes`.
    ///
    /// Handles of removed nodes are detached first and then closed, before
    /// any new handle is opened, so an open failure (or the caller dropping
    /// this future) never leaves a removed node's handle in the pool. In
    /// eager mode every new node is opened; failures are reported in the
    /// returned [`Reconciliation`] and do not stop the remaining opens.
    pub async fn ensure_nodes(&self, nodes: &[NodeId]) -> Reconciliation {
        let target: BTreeSet<NodeId> = nodes.iter().cloned().collect();
        let mut report = Reconciliation::default();
        let mut state = self.state.lock().await;

        // Release pass.
        let removed: Vec<NodeId> = state.known.difference(&target).cloned().collect();
        let mut detached = Vec::with_capacity(removed.len());
        for node in removed {
            state.known.remove(&node);
            if let Some(handle) = state.handles.remove(&node) {
                detached.push(handle);
            }
            report.released.push(node);
        }
        for handle in detached {
            handle.close().await;
        }

        // Open pass.
        for node in &target {
            state.known.insert(node.clone());
            if self.mode == ConnectMode::Lazy || state.handles.contains_key(node) {
                continue;
            }
            match self.connector.connect(node).await {
                Ok(handle) => {
                    state.handles.insert(node.clone(), handle);
                    report.opened.push(node.clone());
                }
                Err(e) => {
                    warn!(node = %node, error = %e, "eager open of store handle failed");
                    report.failed.push((node.clone(), e));
                }
            }
        }

        info!(
            nodes = state.known.len(),
            opened = report.opened.len(),
            released = report.released.len(),
            failed = report.failed.len(),
            "store pool reconciled"
        );
        report
    }

    /// Close and drop every handle. Known nodes stay known.
    pub async fn close_all(&self) {
        let handles: Vec<Arc<dyn MembershipStore>> = {
            let mut state = self.state.lock().await;
            state.handles.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            handle.close().await;
        }
    }

    /// Nodes currently in the pool, sorted.
    pub async fn node_ids(&self) -> Vec<NodeId> {
        self.state.lock().await.known.iter().cloned().collect()
    }

    /// Number of nodes with an open handle.
    pub async fn open_count(&self) -> usize {
        self.state.lock().await.handles.len()
    }

    /// The pool's connection mode.
    pub fn mode(&self) -> ConnectMode {
        self.mode
    }
}

/// Connector serving pre-built handles, keyed by node id.
///
/// Backs the in-memory store tier and tests. Unregistered nodes fail to
/// connect.
#[derive(Default, Clone)]
pub struct StaticConnector {
    stores: HashMap<NodeId, Arc<dyn MembershipStore>>,
}

impl StaticConnector {
    /// Create a connector with no registered stores.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handle served for `node_id`.
    pub fn with_store(mut self, node_id: NodeId, store: Arc<dyn MembershipStore>) -> Self {
        self.stores.insert(node_id, store);
        self
    }

    /// Register the handle served for `node_id`.
    pub fn insert(&mut self, node_id: NodeId, store: Arc<dyn MembershipStore>) {
        self.stores.insert(node_id, store);
    }
}

#[async_trait::async_trait]
impl StoreConnector for StaticConnector {
    async fn connect(&self, node_id: &NodeId) -> Result<Arc<dyn MembershipStore>, StoreError> {
        self.stores
            .get(node_id)
            .cloned()
            .ok_or_else(|| StoreError::Connect {
                node: node_id.clone(),
                reason: "no store registered for node".to_string(),
            })
    }
}

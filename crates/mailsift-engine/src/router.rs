//! Key routing: the current ring plus the store handle pool.
//!
//! The ring is immutable once built. [`Router::reconfigure`] builds a new
//! ring for the new node list and swaps the `Arc` in one step, so a lookup
//! sees either the old membership or the new one, never a mix. The pool is
//! widened to the union of both node sets before the swap and narrowed to
//! the new set after it, so every node either ring can route to keeps its
//! pool entry while the swap happens. Reconfigurations run one at a time.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use mailsift_placement::Ring;
use mailsift_store::{Reconciliation, StorePool};
use mailsift_types::NodeId;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::EngineError;

/// Routes keys to store nodes and hands out their handles.
pub struct Router {
    ring: RwLock<Arc<Ring>>,
    pool: Arc<StorePool>,
    replicas: usize,
    /// Held for a whole widen, swap, narrow sequence.
    reconfiguring: Mutex<()>,
}

impl Router {
    /// Build a router over `nodes` and reconcile `pool` with them.
    pub async fn new(
        nodes: &[NodeId],
        replicas: usize,
        pool: Arc<StorePool>,
    ) -> Result<(Self, Reconciliation), EngineError> {
        let ring = Ring::with_nodes(nodes.iter().cloned(), replicas)?;
        let report = pool.ensure_nodes(nodes).await;
        info!(
            nodes = ring.node_count(),
            replicas = ring.replicas(),
            "router ready"
        );

        let router = Self {
            ring: RwLock::new(Arc::new(ring)),
            pool,
            replicas,
            reconfiguring: Mutex::new(()),
        };
        Ok((router, report))
    }

    /// The ring in effect now.
    pub fn ring(&self) -> Arc<Ring> {
        self.ring.read().expect("lock poisoned").clone()
    }

    /// The store handle pool.
    pub fn pool(&self) -> &Arc<StorePool> {
        &self.pool
    }

    /// The node currently responsible for `key`.
    pub fn route(&self, key: &str) -> Option<NodeId> {
        self.ring().route(key).cloned()
    }

    /// Replace the store node set.
    ///
    /// If the new ring cannot be built nothing changes. Otherwise the
    /// returned report lists the handles opened for added nodes and those
    /// released for removed ones. Concurrent calls are applied one after
    /// the other; the last one to run wins.
    pub async fn reconfigure(&self, nodes: &[NodeId]) -> Result<Reconciliation, EngineError> {
        let next = Arc::new(Ring::with_nodes(nodes.iter().cloned(), self.replicas)?);
        let _guard = self.reconfiguring.lock().await;
        let current = self.ring();

        let union: Vec<NodeId> = current
            .node_ids()
            .iter()
            .chain(nodes)
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let widened = self.pool.ensure_nodes(&union).await;

        *self.ring.write().expect("lock poisoned") = next;

        let narrowed = self.pool.ensure_nodes(nodes).await;
        info!(
            nodes = nodes.len(),
            opened = widened.opened.len(),
            released = narrowed.released.len(),
            "store tier reconfigured"
        );

        Ok(Reconciliation {
            opened: widened.opened,
            released: narrowed.released,
            failed: widened.failed,
        })
    }
}

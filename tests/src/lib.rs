//! Shared test harness for mailsift integration tests.
//!
//! Provides [`TestCluster`]: an N-node in-memory store tier with failure
//! and latency injection, plus helpers to run the full worker against a
//! [`MemoryBroker`] (job descriptor → record file → sharded lookups →
//! settlement).

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mailsift_engine::{
    Classifier, CollectingSink, JobReport, RecordPipeline, Router, Worker, WorkerExit,
    WorkerState,
};
use mailsift_placement::Ring;
use mailsift_queue::MemoryBroker;
use mailsift_store::{
    MembershipSet, MembershipStore, MemoryStore, SlowStore, StoreConnector, StoreError, StorePool,
};
use mailsift_types::{
    AckPolicy, ConnectMode, JobDescriptor, JobId, NodeId, QueueSettings, StoreSettings,
    WorkerConfig,
};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;

/// Ring positions per node in test clusters.
pub const REPLICAS: usize = 3;

// =========================================================================
// Fault-injecting store
// =========================================================================

/// Store handle that fails every lookup while its node is marked down.
struct FaultyStore {
    node: NodeId,
    inner: Arc<dyn MembershipStore>,
    down_nodes: Arc<RwLock<HashSet<NodeId>>>,
}

#[async_trait]
impl MembershipStore for FaultyStore {
    async fn is_member(&self, set: MembershipSet, email: &str) -> Result<bool, StoreError> {
        if self.down_nodes.read().await.contains(&self.node) {
            return Err(StoreError::Connect {
                node: self.node.clone(),
                reason: "node is down".into(),
            });
        }
        self.inner.is_member(set, email).await
    }
}

/// Connector handing out [`FaultyStore`]s over the cluster's memory stores.
///
/// Connecting to a down node fails and connecting to a blackholed node
/// never finishes. Slow nodes get a [`SlowStore`] layer.
struct ClusterConnector {
    stores: Arc<RwLock<HashMap<NodeId, Arc<MemoryStore>>>>,
    slow_nodes: Arc<RwLock<HashMap<NodeId, u64>>>,
    down_nodes: Arc<RwLock<HashSet<NodeId>>>,
    blackholed: Arc<RwLock<HashSet<NodeId>>>,
}

#[async_trait]
impl StoreConnector for ClusterConnector {
    async fn connect(&self, node_id: &NodeId) -> Result<Arc<dyn MembershipStore>, StoreError> {
        if self.blackholed.read().await.contains(node_id) {
            std::future::pending::<()>().await;
        }
        if self.down_nodes.read().await.contains(node_id) {
            return Err(StoreError::Connect {
                node: node_id.clone(),
                reason: "connection refused".into(),
            });
        }
        let Some(store) = self.stores.read().await.get(node_id).cloned() else {
            return Err(StoreError::Connect {
                node: node_id.clone(),
                reason: "no such host".into(),
            });
        };

        let inner: Arc<dyn MembershipStore> = match self.slow_nodes.read().await.get(node_id) {
            Some(&ms) => Arc::new(SlowStore::new(store).latency(ms, ms)),
            None => store,
        };
        Ok(Arc::new(FaultyStore {
            node: node_id.clone(),
            inner,
            down_nodes: self.down_nodes.clone(),
        }))
    }
}

// =========================================================================
// TestCluster
// =========================================================================

/// An N-node in-memory store tier.
///
/// Addresses are seeded onto the node the ring assigns them to, so a
/// router built over the same node list finds them.
pub struct TestCluster {
    node_ids: Vec<NodeId>,
    stores: Arc<RwLock<HashMap<NodeId, Arc<MemoryStore>>>>,
    slow_nodes: Arc<RwLock<HashMap<NodeId, u64>>>,
    down_nodes: Arc<RwLock<HashSet<NodeId>>>,
    blackholed: Arc<RwLock<HashSet<NodeId>>>,
    ring: Ring,
    lookup_timeout_ms: u64,
    dir: tempfile::TempDir,
}

impl TestCluster {
    /// Create an N-node cluster named `store-1` .. `store-N`.
    pub fn new(n: usize) -> Self {
        assert!(n <= 100, "too many nodes");

        let node_ids: Vec<NodeId> = (1..=n).map(|i| NodeId::new(format!("store-{i}"))).collect();
        let stores = node_ids
            .iter()
            .map(|n| (n.clone(), Arc::new(MemoryStore::new())))
            .collect();
        let ring = Ring::with_nodes(node_ids.clone(), REPLICAS).unwrap();

        Self {
            node_ids,
            stores: Arc::new(RwLock::new(stores)),
            slow_nodes: Arc::new(RwLock::new(HashMap::new())),
            down_nodes: Arc::new(RwLock::new(HashSet::new())),
            blackholed: Arc::new(RwLock::new(HashSet::new())),
            ring,
            lookup_timeout_ms: 1_000,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    /// Set the per-lookup timeout used by routers and workers built later.
    pub fn with_lookup_timeout(mut self, ms: u64) -> Self {
        self.lookup_timeout_ms = ms;
        self
    }

    /// Get the NodeId of node `i`.
    pub fn node_id(&self, i: usize) -> NodeId {
        self.node_ids[i].clone()
    }

    /// All node ids, in order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.node_ids.clone()
    }

    /// Number of nodes in the cluster.
    pub fn len(&self) -> usize {
        self.node_ids.len()
    }

    /// Returns `true` if the cluster has no nodes.
    pub fn is_empty(&self) -> bool {
        self.node_ids.is_empty()
    }

    /// The placement ring over the cluster's current nodes.
    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    /// Index of the node owning `email`.
    pub fn owner(&self, email: &str) -> usize {
        let node = self.ring.route(email).unwrap();
        self.node_ids.iter().position(|n| n == node).unwrap()
    }

    /// A fresh address (`<prefix>N@example.com`) owned by node `i`.
    pub fn email_on_node(&self, i: usize, prefix: &str) -> String {
        (0..)
            .map(|k| format!("{prefix}{k}@example.com"))
            .find(|e| self.owner(e) == i)
            .unwrap()
    }

    async fn store_of(&self, email: &str) -> Arc<MemoryStore> {
        let node = &self.node_ids[self.owner(email)];
        self.stores.read().await[node].clone()
    }

    /// Mark `email` bounced on its owning node.
    pub async fn bounce(&self, email: &str) {
        self.store_of(email).await.insert(MembershipSet::Bounced, email);
    }

    /// Mark `email` subscribed on its owning node.
    pub async fn subscribe(&self, email: &str) {
        self.store_of(email)
            .await
            .insert(MembershipSet::Subscribed, email);
    }

    /// Make node `i` unreachable: connects and lookups fail.
    pub async fn kill_node(&self, i: usize) {
        self.down_nodes.write().await.insert(self.node_ids[i].clone());
    }

    /// Bring node `i` back.
    pub async fn revive_node(&self, i: usize) {
        self.down_nodes.write().await.remove(&self.node_ids[i]);
    }

    /// Make opening a handle to node `i` hang forever, like a host that
    /// drops packets. Handles opened before the call keep working.
    pub async fn blackhole_node(&self, i: usize) {
        self.blackholed.write().await.insert(self.node_ids[i].clone());
    }

    /// Delay every lookup on node `i` by `ms`. Applies to handles opened
    /// after the call.
    pub async fn slow_node(&self, i: usize, ms: u64) {
        self.slow_nodes
            .write()
            .await
            .insert(self.node_ids[i].clone(), ms);
    }

    /// Add a new empty node and return its index.
    ///
    /// Existing addresses stay on the node they were seeded on; only the
    /// harness ring changes.
    pub async fn add_node(&mut self) -> usize {
        let idx = self.node_ids.len();
        let nid = NodeId::new(format!("store-{}", idx + 1));
        self.stores
            .write()
            .await
            .insert(nid.clone(), Arc::new(MemoryStore::new()));
        self.ring.add_node(nid.clone()).unwrap();
        self.node_ids.push(nid);
        idx
    }

    /// Connector over the cluster's stores.
    pub fn connector(&self) -> Arc<dyn StoreConnector> {
        Arc::new(ClusterConnector {
            stores: self.stores.clone(),
            slow_nodes: self.slow_nodes.clone(),
            down_nodes: self.down_nodes.clone(),
            blackholed: self.blackholed.clone(),
        })
    }

    /// A router over all current nodes, with a lazily connecting pool.
    pub async fn router(&self) -> Arc<Router> {
        let pool = Arc::new(StorePool::new(self.connector(), ConnectMode::Lazy));
        let (router, _) = Router::new(&self.node_ids, REPLICAS, pool).await.unwrap();
        Arc::new(router)
    }

    /// A record pipeline over a fresh router.
    pub async fn pipeline(&self) -> RecordPipeline {
        let classifier = Classifier::new(
            self.router().await,
            Duration::from_millis(self.lookup_timeout_ms),
        );
        RecordPipeline::new(classifier)
    }

    /// Worker configuration for this cluster.
    pub fn worker_config(&self, policy: AckPolicy) -> WorkerConfig {
        WorkerConfig {
            queue: QueueSettings {
                reconnect_delay_ms: 10,
                ack_policy: policy,
                ..QueueSettings::default()
            },
            store: StoreSettings {
                replicas: REPLICAS,
                lookup_timeout_ms: self.lookup_timeout_ms,
                ..StoreSettings::default()
            },
            nodes: self.node_ids.clone(),
        }
    }

    /// Write a record file into the cluster's scratch directory.
    pub fn write_file(&self, name: &str, body: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    /// Path inside the scratch directory that does not exist.
    pub fn missing_file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Start a worker consuming from `broker`.
    pub async fn start_worker(&self, broker: &MemoryBroker, policy: AckPolicy) -> RunningWorker {
        let sink = Arc::new(CollectingSink::new());
        let worker = Worker::from_config(
            &self.worker_config(policy),
            Arc::new(broker.clone()),
            self.connector(),
            sink.clone(),
        )
        .await
        .unwrap();
        let worker = Arc::new(worker);
        let states = worker.subscribe();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run(shutdown_rx).await }
        });

        RunningWorker {
            worker,
            sink,
            states,
            shutdown,
            handle,
        }
    }
}

// =========================================================================
// RunningWorker
// =========================================================================

/// A worker running on a background task.
pub struct RunningWorker {
    /// The worker itself.
    pub worker: Arc<Worker>,
    /// Receives every finished job report.
    pub sink: Arc<CollectingSink>,
    states: watch::Receiver<WorkerState>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<WorkerExit>,
}

impl RunningWorker {
    /// Wait until the worker reaches `state`.
    pub async fn wait_for(&mut self, state: WorkerState) {
        self.states.wait_for(|s| *s == state).await.unwrap();
    }

    /// Reports delivered so far.
    pub fn reports(&self) -> Vec<JobReport> {
        self.sink.reports()
    }

    /// Request shutdown and wait for the worker to return.
    pub async fn stop(self) -> WorkerExit {
        let _ = self.shutdown.send(true);
        self.handle.await.unwrap()
    }

    /// Wait for the worker to return on its own.
    pub async fn join(self) -> WorkerExit {
        self.handle.await.unwrap()
    }
}

/// Encode a job descriptor for `path`.
pub fn job_body(id: &str, path: PathBuf) -> Vec<u8> {
    JobDescriptor {
        job_id: JobId::from(id),
        file_path: path,
        user_id: None,
        original_filename: None,
    }
    .to_vec()
    .unwrap()
}

/// Build a CSV body with an `email` header and one address per row.
pub fn csv_of<S: AsRef<str>>(emails: &[S]) -> String {
    let mut body = String::from("email\n");
    for e in emails {
        body.push_str(e.as_ref());
        body.push('\n');
    }
    body
}

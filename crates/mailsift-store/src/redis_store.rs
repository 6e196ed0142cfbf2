//! Redis-backed membership store.
//!
//! The node identifier is the node's redis URL (`redis://host:6379/0`).
//! Each handle holds one multiplexed connection, opened on construction
//! and re-established after a connection-level failure.

use std::sync::Arc;

use mailsift_types::NodeId;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::traits::{MembershipSet, MembershipStore, SetKeys, StoreConnector};

/// Membership store on a remote redis node, queried with `SISMEMBER`.
pub struct RedisStore {
    node_id: NodeId,
    client: redis::Client,
    keys: SetKeys,
    /// Cached connection. `None` until connected or after a dropped link.
    ///
    /// A `Mutex` rather than a `RwLock` so concurrent lookups after a drop
    /// reconnect once instead of racing to replace each other's connection.
    conn: Mutex<Option<MultiplexedConnection>>,
}

impl RedisStore {
    /// Validate the node's URL without connecting.
    pub fn open(node_id: NodeId, keys: SetKeys) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(node_id.as_str()).map_err(|e| StoreError::InvalidAddress {
                node: node_id.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            node_id,
            client,
            keys,
            conn: Mutex::new(None),
        })
    }

    /// Validate the node's URL and establish the connection.
    pub async fn connect(node_id: NodeId, keys: SetKeys) -> Result<Self, StoreError> {
        let store = Self::open(node_id, keys)?;
        store.connection().await?;
        Ok(store)
    }

    /// The node this handle talks to.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Return the cached connection, connecting first if there is none.
    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| self.map_error(e))?;
        debug!(node = %self.node_id, "connected to store node");
        *slot = Some(conn.clone());
        Ok(conn)
    }

    fn map_error(&self, e: redis::RedisError) -> StoreError {
        if is_link_failure(&e) {
            StoreError::Connect {
                node: self.node_id.clone(),
                reason: e.to_string(),
            }
        } else {
            StoreError::Protocol {
                node: self.node_id.clone(),
                reason: e.to_string(),
            }
        }
    }
}

fn is_link_failure(e: &redis::RedisError) -> bool {
    e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout()
}

#[async_trait::async_trait]
impl MembershipStore for RedisStore {
    async fn is_member(&self, set: MembershipSet, email: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let key = self.keys.key(set);

        match conn.sismember::<_, _, bool>(key, email).await {
            Ok(found) => Ok(found),
            Err(e) => {
                if is_link_failure(&e) {
                    warn!(node = %self.node_id, error = %e, "store link failed, dropping connection");
                    self.conn.lock().await.take();
                }
                Err(self.map_error(e))
            }
        }
    }

    async fn close(&self) {
        if self.conn.lock().await.take().is_some() {
            debug!(node = %self.node_id, "closed store connection");
        }
    }
}

/// Opens [`RedisStore`] handles, treating each node id as a redis URL.
#[derive(Debug, Clone, Default)]
pub struct RedisConnector {
    keys: SetKeys,
}

impl RedisConnector {
    /// Create a connector querying the given set keys.
    pub fn new(keys: SetKeys) -> Self {
        Self { keys }
    }
}

#[async_trait::async_trait]
impl StoreConnector for RedisConnector {
    async fn connect(&self, node_id: &NodeId) -> Result<Arc<dyn MembershipStore>, StoreError> {
        let store = RedisStore::connect(node_id.clone(), self.keys.clone()).await?;
        Ok(Arc::new(store))
    }
}

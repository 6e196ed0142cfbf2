//! Consistent hashing ring implementation.

use std::collections::BTreeMap;

use mailsift_types::NodeId;
use tracing::debug;

use crate::error::RingError;

/// Replica points per node when none is configured.
pub const DEFAULT_REPLICAS: usize = 3;

/// A key whose owning node differs between two ring states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassignment {
    /// The key that moved.
    pub key: String,
    /// Owner in the old ring (`None` if the old ring was empty).
    pub from: Option<NodeId>,
    /// Owner in the new ring (`None` if the new ring is empty).
    pub to: Option<NodeId>,
}

/// Consistent hashing ring mapping keys to store nodes.
///
/// Each node is placed at `replicas` positions on a `u128` ring. Lookups
/// walk clockwise from the key's position to the first replica point.
/// Positions are kept sorted at all times, so a lookup is a single
/// ordered range query.
#[derive(Debug, Clone)]
pub struct Ring {
    /// Replica points: ring position -> node.
    entries: BTreeMap<u128, NodeId>,
    /// Member nodes, in the order they were added.
    nodes: Vec<NodeId>,
    /// Replica points per node.
    replicas: usize,
}

impl Ring {
    /// Create an empty ring placing `replicas` points per node.
    ///
    /// A replica count of zero is raised to one.
    pub fn new(replicas: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            nodes: Vec::new(),
            replicas: replicas.max(1),
        }
    }

    /// Build a ring containing every node in `nodes`, in order.
    pub fn with_nodes<I>(nodes: I, replicas: usize) -> Result<Self, RingError>
    where
        I: IntoIterator<Item = NodeId>,
    {
        let mut ring = Self::new(replicas);
        for node in nodes {
            ring.add_node(node)?;
        }
        Ok(ring)
    }

    /// Add a node to the ring.
    ///
    /// All of the node's replica points are inserted or none are: if any
    /// point collides with an existing one (or with another point of the
    /// same node), [`RingError::PositionCollision`] is returned and the ring
    /// is unchanged. Adding a node that is already present is a no-op.
    pub fn add_node(&mut self, node_id: NodeId) -> Result<(), RingError> {
        if self.contains_node(&node_id) {
            return Ok(());
        }

        let positions: Vec<u128> = (0..self.replicas)
            .map(|i| replica_position(&node_id, i))
            .collect();

        self.insert_points(node_id, positions)
    }

    /// Validate and insert a node's replica points atomically.
    fn insert_points(&mut self, node_id: NodeId, positions: Vec<u128>) -> Result<(), RingError> {
        for (i, pos) in positions.iter().enumerate() {
            if let Some(existing) = self.entries.get(pos) {
                return Err(RingError::PositionCollision {
                    position: *pos,
                    existing: existing.clone(),
                    incoming: node_id,
                });
            }
            if positions[..i].contains(pos) {
                return Err(RingError::PositionCollision {
                    position: *pos,
                    existing: node_id.clone(),
                    incoming: node_id,
                });
            }
        }

        for pos in positions {
            self.entries.insert(pos, node_id.clone());
        }
        debug!(node = %node_id, replicas = self.replicas, "added node to ring");
        self.nodes.push(node_id);
        Ok(())
    }

    /// Remove a node and all of its replica points.
    ///
    /// Returns `false` if the node was not in the ring.
    pub fn remove_node(&mut self, node_id: &NodeId) -> bool {
        let Some(idx) = self.nodes.iter().position(|n| n == node_id) else {
            return false;
        };
        self.nodes.remove(idx);
        self.entries.retain(|_, owner| owner != node_id);
        debug!(node = %node_id, "removed node from ring");
        true
    }

    /// Return the node responsible for `key`, or `None` if the ring is empty.
    ///
    /// The owner is the first replica point whose position is greater than
    /// or equal to the key's position, wrapping around to the lowest point
    /// when the key hashes past the last one.
    pub fn route(&self, key: &str) -> Option<&NodeId> {
        let pos = key_position(key);
        self.entries
            .range(pos..)
            .next()
            .or_else(|| self.entries.iter().next())
            .map(|(_, node)| node)
    }

    /// List the keys whose owner differs between `old` and `new`.
    pub fn reassignments<'a, I>(old: &Ring, new: &Ring, keys: I) -> Vec<Reassignment>
    where
        I: IntoIterator<Item = &'a str>,
    {
        keys.into_iter()
            .filter_map(|key| {
                let from = old.route(key);
                let to = new.route(key);
                (from != to).then(|| Reassignment {
                    key: key.to_string(),
                    from: from.cloned(),
                    to: to.cloned(),
                })
            })
            .collect()
    }

    /// Whether `node_id` is a member of the ring.
    pub fn contains_node(&self, node_id: &NodeId) -> bool {
        self.nodes.contains(node_id)
    }

    /// Member nodes, in the order they were added.
    pub fn node_ids(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Number of member nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Total number of replica points on the ring.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Replica points per node.
    pub fn replicas(&self) -> usize {
        self.replicas
    }

    /// Whether the ring has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterate over replica points in ascending position order.
    pub fn entries(&self) -> impl Iterator<Item = (u128, &NodeId)> {
        self.entries.iter().map(|(pos, node)| (*pos, node))
    }
}

impl Default for Ring {
    fn default() -> Self {
        Self::new(DEFAULT_REPLICAS)
    }
}

/// Position of a key on the ring: the first 16 bytes of `blake3(key)`,
/// big-endian.
pub fn key_position(key: &str) -> u128 {
    hash_position(key.as_bytes())
}

/// Position of a node's replica point: `blake3("{node_id}:{index}")`.
fn replica_position(node_id: &NodeId, index: usize) -> u128 {
    hash_position(format!("{node_id}:{index}").as_bytes())
}

fn hash_position(bytes: &[u8]) -> u128 {
    let hash = blake3::hash(bytes);
    let mut prefix = [0u8; 16];
    prefix.copy_from_slice(&hash.as_bytes()[..16]);
    u128::from_be_bytes(prefix)
}

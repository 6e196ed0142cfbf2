//! Error types for ring construction.

use mailsift_types::NodeId;

/// Errors that can occur while changing ring membership.
#[derive(Debug, thiserror::Error)]
pub enum RingError {
    /// Two replica points hashed to the same ring position.
    ///
    /// The ring is left unchanged: the incoming node is not added at all
    /// rather than silently losing part of its share of the key space.
    #[error("ring position {position:#034x} of {incoming} collides with {existing}")]
    PositionCollision {
        /// The contested ring position.
        position: u128,
        /// The node already holding the position.
        existing: NodeId,
        /// The node whose replica point collided.
        incoming: NodeId,
    },
}

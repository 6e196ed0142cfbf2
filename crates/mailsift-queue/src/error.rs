//! Error types for queue operations.

/// Errors that can occur while talking to the work queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The broker could not be reached.
    #[error("broker unreachable: {0}")]
    Connect(String),

    /// Declaring the queue topology or starting the consumer failed.
    #[error("queue setup failed: {0}")]
    Setup(String),

    /// A message body is not a valid job descriptor.
    #[error("undecodable job descriptor: {0}")]
    Decode(#[from] serde_json::Error),

    /// Acknowledging or rejecting a delivery failed.
    #[error("failed to settle delivery {tag}: {reason}")]
    Settle {
        /// Broker delivery tag.
        tag: u64,
        /// Underlying failure.
        reason: String,
    },

    /// Publishing a message failed.
    #[error("publish failed: {0}")]
    Publish(String),

    /// The connection or channel was lost while consuming.
    #[error("broker connection lost: {0}")]
    Closed(String),
}

impl QueueError {
    /// Whether the error means the broker link is gone.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Closed(_))
    }
}

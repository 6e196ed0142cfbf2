//! Broker, stream and delivery abstractions.

use std::fmt;

use mailsift_types::{JobDescriptor, QueueSettings};

use crate::error::QueueError;

/// A message broker hosting the durable work queue.
///
/// This allows substituting an in-memory broker in tests (avoiding the need
/// for a running RabbitMQ).
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    /// Connect, declare the work queue (idempotently), apply the prefetch
    /// limit and start consuming.
    async fn open(&self, settings: &QueueSettings) -> Result<Box<dyn JobStream>, QueueError>;

    /// Publish a persistent message to the work queue.
    async fn publish(&self, settings: &QueueSettings, body: Vec<u8>) -> Result<(), QueueError>;
}

/// An open consumer on the work queue.
#[async_trait::async_trait]
pub trait JobStream: Send {
    /// Wait for the next delivery.
    ///
    /// `None` means the broker ended the consumer; `Some(Err(_))` means the
    /// link failed. Either way the stream is finished.
    async fn next(&mut self) -> Option<Result<Delivery, QueueError>>;

    /// Cancel the consumer and release the connection.
    async fn close(&mut self);
}

/// Settles a single delivery with the broker.
#[async_trait::async_trait]
pub trait Acknowledger: Send + Sync {
    /// Acknowledge the delivery; the broker forgets the message.
    async fn ack(&self) -> Result<(), QueueError>;

    /// Reject the delivery. With `requeue == false` the broker drops it or
    /// moves it to the queue's dead-letter exchange.
    async fn reject(&self, requeue: bool) -> Result<(), QueueError>;
}

/// A message received from the work queue, awaiting settlement.
pub struct Delivery {
    /// Broker-assigned delivery tag.
    pub tag: u64,
    /// Raw message body.
    pub body: Vec<u8>,
    /// Whether the broker delivered this message before.
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Wrap a received message.
    pub fn new(tag: u64, body: Vec<u8>, redelivered: bool, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            tag,
            body,
            redelivered,
            acker,
        }
    }

    /// Decode the body as a job descriptor.
    pub fn descriptor(&self) -> Result<JobDescriptor, QueueError> {
        Ok(JobDescriptor::from_slice(&self.body)?)
    }

    /// Acknowledge the delivery.
    pub async fn ack(self) -> Result<(), QueueError> {
        self.acker.ack().await
    }

    /// Reject the delivery.
    pub async fn reject(self, requeue: bool) -> Result<(), QueueError> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("tag", &self.tag)
            .field("len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

//! Work queue contract for mailsift workers.
//!
//! A worker consumes [`JobDescriptor`](mailsift_types::JobDescriptor)
//! messages from a named durable queue and settles each delivery once the
//! job has run. This crate defines that contract and two brokers:
//!
//! - [`AmqpBroker`]: RabbitMQ (or any AMQP 0-9-1 broker) via `lapin`.
//! - [`MemoryBroker`]: in-process queue with recorded settlements.

mod amqp;
mod broker;
mod error;
mod memory;

pub use amqp::AmqpBroker;
pub use broker::{Acknowledger, Broker, Delivery, JobStream};
pub use error::QueueError;
pub use memory::{MemoryBroker, Settlement};

//! In-process broker.
//!
//! [`MemoryBroker`] keeps the work queue in a `VecDeque` and records how
//! every delivery was settled, so tests can assert on acknowledgements and
//! dead-lettering without a running broker. It honours the prefetch limit
//! and can be told to refuse connections or to drop the consumer link.
//! Deliveries left unsettled when a consumer is replaced go back to the
//! front of the queue marked as redelivered.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use mailsift_types::{AckPolicy, QueueSettings};
use tokio::sync::Notify;
use tracing::debug;

use crate::broker::{Acknowledger, Broker, Delivery, JobStream};
use crate::error::QueueError;

/// How a delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Acknowledged.
    Acked(Vec<u8>),
    /// Rejected, with the requeue flag given.
    Rejected {
        /// Message body.
        body: Vec<u8>,
        /// Whether the message went back on the queue.
        requeue: bool,
    },
}

struct Message {
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<VecDeque<Message>>,
    settlements: Mutex<Vec<Settlement>>,
    dead_letters: Mutex<Vec<Vec<u8>>>,
    /// Unsettled deliveries by tag.
    in_flight: Mutex<BTreeMap<u64, Vec<u8>>>,
    /// Wakes the consumer on publish, settlement and link loss.
    notify: Notify,
    /// Bumped by every successful open; stale ackers fail to settle.
    generation: AtomicU64,
    next_tag: AtomicU64,
    refuse_connects: AtomicUsize,
    connect_attempts: AtomicUsize,
    severed: AtomicBool,
}

/// In-process broker for tests and local runs.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    /// Create a broker with an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a message body.
    pub fn push(&self, body: Vec<u8>) {
        self.shared
            .queue
            .lock()
            .expect("lock poisoned")
            .push_back(Message {
                body,
                redelivered: false,
            });
        self.shared.notify.notify_one();
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_connects(&self, n: usize) {
        self.shared.refuse_connects.store(n, Ordering::SeqCst);
    }

    /// Number of connection attempts so far, refused ones included.
    pub fn connect_attempts(&self) -> usize {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    /// Drop the consumer link, as if the broker connection was lost.
    pub fn sever(&self) {
        self.shared.severed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();
    }

    /// Messages still waiting on the queue.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().expect("lock poisoned").len()
    }

    /// Deliveries handed out but not yet settled.
    pub fn unacked(&self) -> usize {
        self.shared.in_flight.lock().expect("lock poisoned").len()
    }

    /// Every settlement so far, in order.
    pub fn settlements(&self) -> Vec<Settlement> {
        self.shared.settlements.lock().expect("lock poisoned").clone()
    }

    /// Bodies of acknowledged deliveries.
    pub fn acked(&self) -> Vec<Vec<u8>> {
        self.settlements()
            .into_iter()
            .filter_map(|s| match s {
                Settlement::Acked(body) => Some(body),
                Settlement::Rejected { .. } => None,
            })
            .collect()
    }

    /// Bodies moved to the dead-letter queue.
    pub fn dead_letters(&self) -> Vec<Vec<u8>> {
        self.shared.dead_letters.lock().expect("lock poisoned").clone()
    }

    /// Wait until `n` deliveries have been settled.
    pub async fn wait_settled(&self, n: usize) {
        while self.settlements().len() < n {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
    async fn open(&self, settings: &QueueSettings) -> Result<Box<dyn JobStream>, QueueError> {
        self.shared.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .shared
            .refuse_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(QueueError::Connect("connection refused".to_string()));
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.severed.store(false, Ordering::SeqCst);

        // The previous consumer is gone: its unsettled deliveries return.
        let orphaned = std::mem::take(&mut *self.shared.in_flight.lock().expect("lock poisoned"));
        if !orphaned.is_empty() {
            let mut queue = self.shared.queue.lock().expect("lock poisoned");
            for body in orphaned.into_values().rev() {
                queue.push_front(Message {
                    body,
                    redelivered: true,
                });
            }
        }

        debug!(queue = %settings.queue, prefetch = settings.prefetch, "memory consumer opened");
        Ok(Box::new(MemoryJobStream {
            shared: self.shared.clone(),
            prefetch: usize::from(settings.effective_prefetch()),
            dead_letter: settings.ack_policy == AckPolicy::DeadLetter,
            generation,
        }))
    }

    async fn publish(&self, _settings: &QueueSettings, body: Vec<u8>) -> Result<(), QueueError> {
        self.push(body);
        Ok(())
    }
}

struct MemoryJobStream {
    shared: Arc<Shared>,
    prefetch: usize,
    dead_letter: bool,
    generation: u64,
}

impl MemoryJobStream {
    fn try_take(&self) -> Option<(u64, Message)> {
        let mut in_flight = self.shared.in_flight.lock().expect("lock poisoned");
        if in_flight.len() >= self.prefetch {
            return None;
        }
        let msg = self.shared.queue.lock().expect("lock poisoned").pop_front()?;
        let tag = self.shared.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        in_flight.insert(tag, msg.body.clone());
        Some((tag, msg))
    }
}

#[async_trait::async_trait]
impl JobStream for MemoryJobStream {
    async fn next(&mut self) -> Option<Result<Delivery, QueueError>> {
        loop {
            let notified = self.shared.notify.notified();

            if self.shared.severed.load(Ordering::SeqCst) {
                return Some(Err(QueueError::Closed("link severed".to_string())));
            }
            if self.shared.generation.load(Ordering::SeqCst) != self.generation {
                return Some(Err(QueueError::Closed("consumer replaced".to_string())));
            }
            if let Some((tag, msg)) = self.try_take() {
                let acker = MemoryAcker {
                    shared: self.shared.clone(),
                    tag,
                    generation: self.generation,
                    body: msg.body.clone(),
                    dead_letter: self.dead_letter,
                };
                return Some(Ok(Delivery::new(
                    tag,
                    msg.body,
                    msg.redelivered,
                    Box::new(acker),
                )));
            }

            notified.await;
        }
    }

    async fn close(&mut self) {
        debug!("memory consumer closed");
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    tag: u64,
    generation: u64,
    body: Vec<u8>,
    dead_letter: bool,
}

impl MemoryAcker {
    /// Remove the delivery from the in-flight set. Fails if the consumer
    /// that received it has been replaced or the link was severed.
    fn take(&self) -> Result<(), QueueError> {
        let stale = self.shared.generation.load(Ordering::SeqCst) != self.generation
            || self.shared.severed.load(Ordering::SeqCst);
        let mut in_flight = self.shared.in_flight.lock().expect("lock poisoned");
        if stale || in_flight.remove(&self.tag).is_none() {
            return Err(QueueError::Settle {
                tag: self.tag,
                reason: "channel closed".to_string(),
            });
        }
        Ok(())
    }

    fn record(&self, settlement: Settlement) {
        self.shared
            .settlements
            .lock()
            .expect("lock poisoned")
            .push(settlement);
        self.shared.notify.notify_one();
    }
}

#[async_trait::async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), QueueError> {
        self.take()?;
        self.record(Settlement::Acked(self.body.clone()));
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), QueueError> {
        self.take()?;
        if requeue {
            self.shared
                .queue
                .lock()
                .expect("lock poisoned")
                .push_front(Message {
                    body: self.body.clone(),
                    redelivered: true,
                });
        } else if self.dead_letter {
            self.shared
                .dead_letters
                .lock()
                .expect("lock poisoned")
                .push(self.body.clone());
        }
        self.record(Settlement::Rejected {
            body: self.body.clone(),
            requeue,
        });
        Ok(())
    }
}

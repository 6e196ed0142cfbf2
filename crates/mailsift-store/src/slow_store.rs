//! Latency injection for store lookups.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::StoreError;
use crate::traits::{MembershipSet, MembershipStore};

/// Wraps a store and stalls each membership query for a random time drawn
/// from `[min, max]` milliseconds before forwarding it.
///
/// Lets tests push a node past the classifier's lookup timeout, which an
/// in-memory store never does on its own. Draws come from a seeded RNG, so
/// a given seed always produces the same delays.
pub struct SlowStore {
    inner: Arc<dyn MembershipStore>,
    min_ms: u64,
    max_ms: u64,
    rng: Mutex<StdRng>,
}

impl SlowStore {
    /// Wrap `inner` without any delay.
    pub fn new(inner: Arc<dyn MembershipStore>) -> Self {
        Self {
            inner,
            min_ms: 0,
            max_ms: 0,
            rng: Mutex::new(StdRng::seed_from_u64(0)),
        }
    }

    /// Delay range in milliseconds. `min >= max` means a fixed `max`.
    pub fn latency(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.min_ms = min_ms;
        self.max_ms = max_ms;
        self
    }

    /// Reseed the delay generator.
    pub fn seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    fn next_delay(&self) -> Duration {
        let ms = if self.min_ms >= self.max_ms {
            self.max_ms
        } else {
            self.rng
                .lock()
                .expect("lock poisoned")
                .random_range(self.min_ms..=self.max_ms)
        };
        Duration::from_millis(ms)
    }
}

#[async_trait::async_trait]
impl MembershipStore for SlowStore {
    async fn is_member(&self, set: MembershipSet, email: &str) -> Result<bool, StoreError> {
        let delay = self.next_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.inner.is_member(set, email).await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

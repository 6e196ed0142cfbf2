//! Worker: the consume-forever loop and its connection policy.
//!
//! ```text
//! Disconnected -> Connecting -> Consuming <-> Processing
//!       ^             |             |
//!       +-- retry ----+             +--> Stopped (shutdown)
//!                                   +--> Disconnected (link lost, exit)
//! ```
//!
//! Connecting is retried without limit, with a fixed delay between
//! attempts, because until a job has been received there is nothing else
//! useful to do. Losing the link after that ends [`Worker::run`]; restarting
//! is up to whatever supervises the process.

use std::fmt;
use std::sync::Arc;

use mailsift_queue::{Broker, JobStream, QueueError};
use mailsift_store::{StoreConnector, StorePool};
use mailsift_types::{QueueSettings, WorkerConfig};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::classifier::Classifier;
use crate::consumer::{ConsumeEnd, ConsumerStats, JobConsumer};
use crate::error::EngineError;
use crate::pipeline::RecordPipeline;
use crate::router::Router;
use crate::sink::ResultSink;

/// Observable worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// No broker connection.
    Disconnected,
    /// Opening the broker connection.
    Connecting,
    /// Waiting for the next job.
    Consuming,
    /// Running a job.
    Processing,
    /// Shut down after a shutdown request.
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Consuming => "consuming",
            Self::Processing => "processing",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Why [`Worker::run`] returned.
#[derive(Debug)]
pub enum WorkerExit {
    /// Shutdown was requested; the in-flight job (if any) was settled.
    Shutdown,
    /// The broker link was lost or the broker cancelled the consumer.
    ConnectionLost(Option<QueueError>),
}

/// A worker process: one broker consumer feeding one job at a time to the
/// record pipeline.
pub struct Worker {
    settings: QueueSettings,
    broker: Arc<dyn Broker>,
    consumer: JobConsumer,
    router: Arc<Router>,
    state: watch::Sender<WorkerState>,
}

impl Worker {
    /// Assemble a worker from its parts.
    pub fn new(
        settings: QueueSettings,
        broker: Arc<dyn Broker>,
        consumer: JobConsumer,
        router: Arc<Router>,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Disconnected);
        Self {
            settings,
            broker,
            consumer,
            router,
            state,
        }
    }

    /// Build the ring, store pool, pipeline and consumer from `config`.
    ///
    /// Fails only if the ring cannot be built. In eager mode, nodes that
    /// cannot be reached now are logged and retried on first use.
    pub async fn from_config(
        config: &WorkerConfig,
        broker: Arc<dyn Broker>,
        connector: Arc<dyn StoreConnector>,
        sink: Arc<dyn ResultSink>,
    ) -> Result<Self, EngineError> {
        let pool = Arc::new(StorePool::new(connector, config.store.connect));
        let (router, report) = Router::new(&config.nodes, config.store.replicas, pool).await?;
        for (node, e) in &report.failed {
            warn!(%node, error = %e, "store node unreachable at startup");
        }

        let router = Arc::new(router);
        let classifier = Classifier::new(router.clone(), config.store.lookup_timeout());
        let consumer = JobConsumer::new(
            RecordPipeline::new(classifier),
            sink,
            config.queue.ack_policy,
        );

        Ok(Self::new(config.queue.clone(), broker, consumer, router))
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Current state.
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// The router shared with the classifier.
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Consumer activity so far.
    pub fn stats(&self) -> ConsumerStats {
        self.consumer.stats()
    }

    /// Connect and consume until shutdown or until the broker link is lost.
    ///
    /// Setting `shutdown` to `true` (or dropping its sender) stops the
    /// worker: while connecting the retry loop is abandoned at once; while
    /// consuming the job in flight is finished and settled first. The broker
    /// connection is closed before returning.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> WorkerExit {
        let Some(mut stream) = self.connect(&mut shutdown).await else {
            self.state.send_replace(WorkerState::Stopped);
            info!("worker stopped before connecting");
            return WorkerExit::Shutdown;
        };

        self.state.send_replace(WorkerState::Consuming);
        let end = self
            .consumer
            .run(stream.as_mut(), &mut shutdown, &self.state)
            .await;
        stream.close().await;

        match end {
            ConsumeEnd::Shutdown => {
                self.state.send_replace(WorkerState::Stopped);
                info!(stats = ?self.stats(), "worker stopped");
                WorkerExit::Shutdown
            }
            ConsumeEnd::StreamEnded => {
                self.state.send_replace(WorkerState::Disconnected);
                error!("broker cancelled the consumer");
                WorkerExit::ConnectionLost(None)
            }
            ConsumeEnd::ConnectionLost(e) => {
                self.state.send_replace(WorkerState::Disconnected);
                error!(error = %e, "broker connection lost");
                WorkerExit::ConnectionLost(Some(e))
            }
        }
    }

    /// Open the consumer, retrying until it succeeds or shutdown is
    /// requested.
    async fn connect(&self, shutdown: &mut watch::Receiver<bool>) -> Option<Box<dyn JobStream>> {
        let delay = self.settings.reconnect_delay();
        let mut attempt: u64 = 0;

        loop {
            if *shutdown.borrow_and_update() {
                return None;
            }

            attempt += 1;
            self.state.send_replace(WorkerState::Connecting);
            let opened = tokio::select! {
                opened = self.broker.open(&self.settings) => opened,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                    continue;
                }
            };
            match opened {
                Ok(stream) => {
                    info!(attempt, queue = %self.settings.queue, "connected to broker");
                    return Some(stream);
                }
                Err(e) => {
                    self.state.send_replace(WorkerState::Disconnected);
                    warn!(attempt, error = %e, retry_in = ?delay, "broker connection failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }
}

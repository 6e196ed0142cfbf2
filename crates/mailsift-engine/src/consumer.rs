//! Job consumption: run each delivered job and settle it with the broker.
//!
//! One job is processed at a time. A shutdown request is honoured only
//! between jobs; the job in flight always runs to completion and is
//! settled first.
//!
//! Settlement follows the configured [`AckPolicy`]:
//!
//! | Job result                          | `Always` | `DeadLetter` |
//! |-------------------------------------|----------|--------------|
//! | completed, some records classified  | ack      | ack          |
//! | completed, no records at all        | ack      | ack          |
//! | every record `ERROR` / `UNKNOWN`    | ack      | reject       |
//! | source missing or unreadable        | ack      | reject       |
//! | body is not a job descriptor        | ack      | reject       |
//!
//! Rejections never requeue, so a poison message cannot loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use mailsift_queue::{Delivery, JobStream, QueueError};
use mailsift_types::AckPolicy;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::pipeline::{JobReport, RecordPipeline};
use crate::sink::ResultSink;
use crate::worker::WorkerState;

/// What the consumer did with a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Acknowledged.
    Ack,
    /// Rejected without requeue, to the dead-letter path.
    DeadLetter,
}

/// Why [`JobConsumer::run`] returned.
#[derive(Debug)]
pub enum ConsumeEnd {
    /// Shutdown was requested.
    Shutdown,
    /// The broker ended the consumer.
    StreamEnded,
    /// The broker link failed.
    ConnectionLost(QueueError),
}

/// Counters of a consumer's activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Jobs acknowledged.
    pub acked: u64,
    /// Jobs rejected to the dead-letter path.
    pub dead_lettered: u64,
    /// Deliveries whose body was not a job descriptor.
    pub undecodable: u64,
    /// Records classified across all jobs.
    pub records: u64,
}

#[derive(Default)]
struct Counters {
    acked: AtomicU64,
    dead_lettered: AtomicU64,
    undecodable: AtomicU64,
    records: AtomicU64,
}

/// Runs delivered jobs through the record pipeline.
pub struct JobConsumer {
    pipeline: RecordPipeline,
    sink: Arc<dyn ResultSink>,
    policy: AckPolicy,
    counters: Counters,
}

impl JobConsumer {
    /// Create a consumer.
    pub fn new(pipeline: RecordPipeline, sink: Arc<dyn ResultSink>, policy: AckPolicy) -> Self {
        Self {
            pipeline,
            sink,
            policy,
            counters: Counters::default(),
        }
    }

    /// The acknowledgement policy in effect.
    pub fn policy(&self) -> AckPolicy {
        self.policy
    }

    /// Snapshot of the activity counters.
    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            acked: self.counters.acked.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            undecodable: self.counters.undecodable.load(Ordering::Relaxed),
            records: self.counters.records.load(Ordering::Relaxed),
        }
    }

    /// How a delivery is settled. `None` stands for an undecodable body.
    pub fn disposition(&self, report: Option<&JobReport>) -> Disposition {
        match self.policy {
            AckPolicy::Always => Disposition::Ack,
            AckPolicy::DeadLetter => match report {
                Some(report) if !report.is_batch_failure() => Disposition::Ack,
                _ => Disposition::DeadLetter,
            },
        }
    }

    /// Consume from `stream` until shutdown or until the stream ends.
    ///
    /// The worker's state is set to `Processing` while a job runs and back
    /// to `Consuming` once it is settled.
    pub async fn run(
        &self,
        stream: &mut dyn JobStream,
        shutdown: &mut watch::Receiver<bool>,
        state: &watch::Sender<WorkerState>,
    ) -> ConsumeEnd {
        loop {
            if *shutdown.borrow_and_update() {
                return ConsumeEnd::Shutdown;
            }

            let next = tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped sender means nobody can ask us to keep going.
                    if changed.is_err() {
                        return ConsumeEnd::Shutdown;
                    }
                    continue;
                }
                next = stream.next() => next,
            };

            let delivery = match next {
                None => return ConsumeEnd::StreamEnded,
                Some(Err(e)) => return ConsumeEnd::ConnectionLost(e),
                Some(Ok(delivery)) => delivery,
            };

            state.send_replace(WorkerState::Processing);
            let settled = self.handle(delivery).await;
            state.send_replace(WorkerState::Consuming);

            if let Err(e) = settled {
                return ConsumeEnd::ConnectionLost(e);
            }
        }
    }

    /// Process one delivery and settle it.
    ///
    /// Only a failure to settle is returned; everything that can go wrong
    /// with the job itself is folded into the disposition.
    #[tracing::instrument(
        skip(self, delivery),
        fields(tag = delivery.tag, job_id = tracing::field::Empty)
    )]
    pub async fn handle(&self, delivery: Delivery) -> Result<Disposition, QueueError> {
        let report = match delivery.descriptor() {
            Ok(job) => {
                tracing::Span::current().record("job_id", tracing::field::display(&job.job_id));
                if delivery.redelivered {
                    info!("job redelivered, processing again");
                } else {
                    info!(file = %job.file_path.display(), "job received");
                }

                let report = self.pipeline.process(&job).await;
                self.counters
                    .records
                    .fetch_add(report.counts.total(), Ordering::Relaxed);
                if let Err(e) = self.sink.deliver(&report).await {
                    warn!(error = %e, "result sink rejected report");
                }
                Some(report)
            }
            Err(e) => {
                warn!(error = %e, "discarding undecodable delivery");
                self.counters.undecodable.fetch_add(1, Ordering::Relaxed);
                None
            }
        };

        let disposition = self.disposition(report.as_ref());
        match disposition {
            Disposition::Ack => {
                delivery.ack().await?;
                self.counters.acked.fetch_add(1, Ordering::Relaxed);
                debug!("delivery acknowledged");
            }
            Disposition::DeadLetter => {
                delivery.reject(false).await?;
                self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                warn!(
                    status = ?report.as_ref().map(|r| r.status),
                    "job failed as a whole, sent to dead-letter path"
                );
            }
        }
        Ok(disposition)
    }
}

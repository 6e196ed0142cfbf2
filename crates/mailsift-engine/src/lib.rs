//! Job processing for mailsift workers.
//!
//! Components, leaf first:
//!
//! - [`Router`]: the current consistent-hash ring and the store handle
//!   pool, swapped together on reconfiguration.
//! - [`Classifier`]: classifies one address against its owning node.
//! - [`RecordPipeline`]: reads a job's CSV source and classifies every
//!   address in order.
//! - [`JobConsumer`]: runs delivered jobs and settles them with the broker
//!   according to the [`AckPolicy`](mailsift_types::AckPolicy).
//! - [`Worker`]: connects to the broker (retrying forever) and drives the
//!   consumer until shutdown or link loss.

pub mod classifier;
pub mod consumer;
pub mod error;
pub mod pipeline;
pub mod router;
pub mod sink;
pub mod worker;

pub use classifier::Classifier;
pub use consumer::{ConsumeEnd, ConsumerStats, Disposition, JobConsumer};
pub use error::{EngineError, SourceError};
pub use pipeline::{
    JobReport, JobStatus, ParsedRecords, RecordOutcome, RecordPipeline, parse_records, read_source,
};
pub use router::Router;
pub use sink::{CollectingSink, LogSink, ResultSink};
pub use worker::{Worker, WorkerExit, WorkerState};

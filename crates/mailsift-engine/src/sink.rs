//! Result handoff.
//!
//! Persisting results is someone else's job; the worker only hands each
//! finished [`JobReport`] to a [`ResultSink`].

use std::sync::Mutex;

use tracing::info;

use crate::error::EngineError;
use crate::pipeline::JobReport;

/// Receives every finished job report.
#[async_trait::async_trait]
pub trait ResultSink: Send + Sync {
    /// Take a finished report.
    async fn deliver(&self, report: &JobReport) -> Result<(), EngineError>;
}

/// Logs each report's tallies.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait::async_trait]
impl ResultSink for LogSink {
    async fn deliver(&self, report: &JobReport) -> Result<(), EngineError> {
        info!(
            job_id = %report.job_id,
            status = %report.status,
            records = report.outcomes.len(),
            skipped = report.skipped,
            counts = %report.counts,
            "job finished"
        );
        Ok(())
    }
}

/// Keeps every report in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    reports: Mutex<Vec<JobReport>>,
}

impl CollectingSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports received so far, in delivery order.
    pub fn reports(&self) -> Vec<JobReport> {
        self.reports.lock().expect("lock poisoned").clone()
    }
}

#[async_trait::async_trait]
impl ResultSink for CollectingSink {
    async fn deliver(&self, report: &JobReport) -> Result<(), EngineError> {
        self.reports
            .lock()
            .expect("lock poisoned")
            .push(report.clone());
        Ok(())
    }
}

//! Record pipeline: read a job's CSV source and classify every address.
//!
//! Records are classified one after another, in source order. The unit of
//! parallelism is the job, not the record, so one job never has more than
//! one lookup in flight against the store tier.

use std::fmt;
use std::path::Path;

use mailsift_types::{JobDescriptor, JobId, Outcome, OutcomeCounts};
use tracing::{debug, info, warn};

use crate::classifier::Classifier;
use crate::error::SourceError;

/// Header naming the address column, matched case-insensitively.
const EMAIL_HEADER: &str = "email";

/// How far a job got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Every record was read and classified.
    Completed,
    /// The record source does not exist.
    SourceNotFound,
    /// The record source could not be read as text.
    SourceUnreadable,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::SourceNotFound => f.write_str("source-not-found"),
            Self::SourceUnreadable => f.write_str("source-unreadable"),
        }
    }
}

/// One classified address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOutcome {
    /// The address, exactly as it appeared in the source.
    pub email: String,
    /// Its classification.
    pub outcome: Outcome,
}

/// Everything a job produced.
#[derive(Debug, Clone)]
pub struct JobReport {
    /// The job this report belongs to.
    pub job_id: JobId,
    /// Classified addresses, in source order.
    pub outcomes: Vec<RecordOutcome>,
    /// Tally per outcome.
    pub counts: OutcomeCounts,
    /// Rows without a usable address.
    pub skipped: u64,
    /// Whether the source could be processed.
    pub status: JobStatus,
    /// Description of the source failure, if any.
    pub error: Option<String>,
}

impl JobReport {
    fn failed(job_id: JobId, err: &SourceError) -> Self {
        let status = match err {
            SourceError::NotFound { .. } => JobStatus::SourceNotFound,
            SourceError::Unreadable { .. } => JobStatus::SourceUnreadable,
        };
        Self {
            job_id,
            outcomes: Vec::new(),
            counts: OutcomeCounts::new(),
            skipped: 0,
            status,
            error: Some(err.to_string()),
        }
    }

    /// Whether the job failed as a whole: its source could not be read, or
    /// it had records and not one of them was classified by a store node.
    pub fn is_batch_failure(&self) -> bool {
        if self.status != JobStatus::Completed {
            return true;
        }
        let total = self.counts.total();
        total > 0 && self.counts.failures() == total
    }
}

/// Addresses pulled from a CSV source.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ParsedRecords {
    /// Addresses in source order.
    pub emails: Vec<String>,
    /// Rows without a usable address.
    pub skipped: u64,
}

/// Extract the address column from CSV text.
///
/// The column is the first header equal to `email` ignoring ASCII case and
/// surrounding whitespace. Rows whose field is missing or empty, and rows
/// the CSV reader rejects, are counted as skipped. Without such a header
/// every row is skipped.
pub fn parse_records(text: &str) -> ParsedRecords {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());

    let column = match reader.headers() {
        Ok(headers) => headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(EMAIL_HEADER)),
        Err(e) => {
            warn!(error = %e, "unreadable header row");
            None
        }
    };

    let mut parsed = ParsedRecords::default();
    for (row, record) in reader.records().enumerate() {
        let email = match (&record, column) {
            (Ok(record), Some(idx)) => record.get(idx).filter(|v| !v.is_empty()),
            _ => None,
        };
        match email {
            Some(email) => parsed.emails.push(email.to_string()),
            None => {
                if let Err(e) = &record {
                    debug!(row, error = %e, "skipping malformed row");
                }
                parsed.skipped += 1;
            }
        }
    }
    parsed
}

/// Read a record source as UTF-8 text.
pub async fn read_source(path: &Path) -> Result<String, SourceError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            SourceError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            SourceError::Unreadable {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        }
    })?;

    String::from_utf8(bytes).map_err(|e| SourceError::Unreadable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Turns a job into a [`JobReport`].
#[derive(Clone)]
pub struct RecordPipeline {
    classifier: Classifier,
}

impl RecordPipeline {
    /// Create a pipeline classifying with `classifier`.
    pub fn new(classifier: Classifier) -> Self {
        Self { classifier }
    }

    /// The classifier used for every record.
    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Process the job's record source. Never fails: a missing or
    /// unreadable source is reported through [`JobReport::status`].
    pub async fn process(&self, job: &JobDescriptor) -> JobReport {
        match read_source(&job.file_path).await {
            Ok(text) => self.process_text(job.job_id.clone(), &text).await,
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "record source failed");
                JobReport::failed(job.job_id.clone(), &e)
            }
        }
    }

    /// Process CSV text already in memory.
    pub async fn process_text(&self, job_id: JobId, text: &str) -> JobReport {
        let parsed = parse_records(text);
        let mut counts = OutcomeCounts::new();
        let mut outcomes = Vec::with_capacity(parsed.emails.len());

        for email in parsed.emails {
            let outcome = self.classifier.classify(&email).await;
            counts.record(outcome);
            outcomes.push(RecordOutcome { email, outcome });
        }

        info!(
            %job_id,
            records = outcomes.len(),
            skipped = parsed.skipped,
            %counts,
            "job records classified"
        );

        JobReport {
            job_id,
            outcomes,
            counts,
            skipped: parsed.skipped,
            status: JobStatus::Completed,
            error: None,
        }
    }
}

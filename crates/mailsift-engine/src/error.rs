//! Error types for the engine.

use std::path::PathBuf;

/// Errors that can occur while building or running a worker.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The ring could not be built from the configured nodes.
    #[error("ring error: {0}")]
    Ring(#[from] mailsift_placement::RingError),

    /// A result sink refused a report. Returned by [`ResultSink`]
    /// implementations; the consumer logs it and settles the job anyway.
    ///
    /// [`ResultSink`]: crate::ResultSink
    #[error("result sink error: {0}")]
    Sink(String),
}

/// Why a job's record source could not be processed.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The file does not exist.
    #[error("record source not found: {}", path.display())]
    NotFound {
        /// Path given by the job descriptor.
        path: PathBuf,
    },

    /// The file exists but could not be read or is not UTF-8 text.
    #[error("record source {} unreadable: {reason}", path.display())]
    Unreadable {
        /// Path given by the job descriptor.
        path: PathBuf,
        /// Underlying failure.
        reason: String,
    },
}

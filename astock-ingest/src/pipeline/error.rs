//! Error taxonomy of the ingestion pipeline.
//!
//! Only [`PipelineError`] aborts a run. Everything that can go wrong for a
//! single unit or batch is recorded in the run's failure ledger instead.

use chrono::NaiveDate;
use thiserror::Error;

/// Failure of a single fetch attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Network hiccup, throttling, unparseable body: worth another attempt
    #[error("transient fetch error: {0}")]
    Transient(String),

    /// The request itself is wrong; retrying cannot help
    #[error("permanent fetch error: {0}")]
    Permanent(String),
}

impl FetchError {
    /// Check if the error is recoverable (worth retrying)
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Failure of the identifier-source collaborator.
#[derive(Debug, Clone, Error)]
#[error("identifier source error: {0}")]
pub struct SourceError(pub String);

/// Failure reported by the storage collaborator.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// One statement or batch failed; the connection is still usable
    #[error("statement failed: {0}")]
    Statement(String),

    /// The connection is gone; nothing further can be written
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A relation or column name is not a plain identifier
    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),
}

impl StorageError {
    /// Whether the whole run must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Run-level failure.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// No work units could be produced; raised before any fetch
    #[error("enumeration failed: {0}")]
    EnumerationFailed(String),

    /// The storage connection was lost
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[source] StorageError),

    /// Schema setup or staging merge statement failed
    #[error("storage error: {0}")]
    Storage(#[source] StorageError),

    /// Reading or writing the progress checkpoint failed
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("invalid date range: {start} is after {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },
}

impl From<StorageError> for PipelineError {
    fn from(err: StorageError) -> Self {
        if err.is_fatal() {
            Self::StorageUnavailable(err)
        } else {
            Self::Storage(err)
        }
    }
}

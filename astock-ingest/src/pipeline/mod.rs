//! Idempotent incremental ingestion pipeline.
//!
//! One run moves work units through four stages:
//!
//! ```text
//! UnitEnumerator ──► FetchPool ──► Normalizer ──► UpsertSink
//!   (ordered ids)   (N workers,    (runs in the    (single writer,
//!                    retry+pacing)  fetch worker)   keyed merge)
//! ```
//!
//! The pipeline knows nothing about a particular provider or SQL dialect:
//! providers plug in through [`DataSource`] / [`IdentifierSource`], the
//! warehouse through [`Storage`], and operator prompts through [`Confirm`].

pub mod checkpoint;
pub mod confirm;
pub mod enumerator;
mod error;
pub mod fetch_pool;
pub mod normalizer;
pub mod retry;
pub mod runner;
pub mod schema;
pub mod sink;

pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpoint, MemoryCheckpoint};
pub use confirm::{AutoConfirm, Confirm, PromptConfirm, StdinConfirm};
pub use enumerator::{
    slice_after_checkpoint, IdentifierSource, MarketFilter, ReportPeriods, StaticIdentifiers,
    UnitEnumerator,
};
pub use error::{FetchError, PipelineError, SourceError, StorageError};
pub use fetch_pool::{DataSource, FetchPool, FetchPoolOptions, Pacing};
pub use normalizer::{DerivedRule, FieldMapping, NormalizedUnit, Normalizer, NormalizerSpec};
pub use retry::RetryPolicy;
pub use runner::{CancelFlag, IngestionRun, RunOptions, RunOutcome, RunState};
pub use schema::{ColumnKind, ColumnSpec, FieldValue, Row, TableSchema, LAST_UPDATED};
pub use sink::{SinkOptions, SinkReport, Storage, UpsertSink};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Core Data Types
// ============================================================================

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateRange {
    /// Create a range; `start` must not be after `end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, PipelineError> {
        if start > end {
            return Err(PipelineError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// Window from optional bounds. With neither bound there is no window;
    /// otherwise a missing start means 1990-01-01 and a missing end `today`.
    pub fn from_bounds(
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        today: NaiveDate,
    ) -> Result<Option<Self>, PipelineError> {
        if start.is_none() && end.is_none() {
            return Ok(None);
        }
        let earliest = NaiveDate::from_ymd_opt(1990, 1, 1).unwrap_or(NaiveDate::MIN);
        Self::new(start.unwrap_or(earliest), end.unwrap_or(today)).map(Some)
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    /// Whether `date` falls inside the range (both bounds inclusive).
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// One item of fetch/process work (an instrument, a report period, a market).
///
/// Immutable once enumerated; consumed exactly once by the fetch pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkUnit {
    /// Canonical identifier, e.g. `sh600000`, `20230630`, `SH`
    pub id: String,
    /// Optional date window applied to this unit
    pub range: Option<DateRange>,
}

impl WorkUnit {
    pub fn new(id: impl Into<String>, range: Option<DateRange>) -> Self {
        Self {
            id: id.into(),
            range,
        }
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.range {
            Some(range) => write!(f, "{} [{}]", self.id, range),
            None => write!(f, "{}", self.id),
        }
    }
}

/// One provider record: field name → JSON value.
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// Unprocessed response for one work unit.
#[derive(Debug, Clone, PartialEq)]
pub enum RawResult {
    /// At least one record
    Records(Vec<RawRecord>),
    /// The provider legitimately has no data for this unit
    Empty,
}

impl RawResult {
    /// Wrap records, turning an empty list into [`RawResult::Empty`].
    pub fn from_records(records: Vec<RawRecord>) -> Self {
        if records.is_empty() {
            Self::Empty
        } else {
            Self::Records(records)
        }
    }
}

/// Terminal outcome of fetching one work unit.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Fetched(Vec<RawRecord>),
    Empty,
    Failed { reason: String, attempts: u32 },
}

impl FetchOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Pipeline stage where a unit failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Fetch,
    Sink,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetch => write!(f, "fetch"),
            Self::Sink => write!(f, "sink"),
        }
    }
}

/// Failure ledger entry, surfaced to the operator for manual re-run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedUnit {
    pub unit_id: String,
    pub stage: FailureStage,
    pub reason: String,
}

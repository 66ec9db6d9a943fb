//! Run orchestration.
//!
//! ```text
//! Enumerating ─► Fetching ─► Normalizing ─► Upserting ─┬─► Completed
//!                   ▲                                  ├─► CompletedWithFailures
//!                   └──────── next unit batch ◄────────┘
//!                                                      └─► Cancelled
//! ```
//!
//! Units are processed in batches of `unit_batch_size`. The batch boundary is
//! where the checkpoint is written and where cancellation is honoured.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, info_span, warn, Instrument};

use astock_common::logging::generate_run_id;
use astock_common::Config;

use super::checkpoint::{Checkpoint, CheckpointStore, MemoryCheckpoint};
use super::confirm::{AutoConfirm, Confirm};
use super::enumerator::{slice_after_checkpoint, IdentifierSource, UnitEnumerator};
use super::fetch_pool::{DataSource, FetchPool, FetchPoolOptions};
use super::normalizer::{NormalizedUnit, Normalizer};
use super::sink::UpsertSink;
use super::{FailedUnit, FailureStage, FetchOutcome, PipelineError};

// ============================================================================
// State
// ============================================================================

/// Lifecycle state of one ingestion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Enumerating,
    Fetching,
    Normalizing,
    Upserting,
    Completed,
    CompletedWithFailures,
    /// Stopped at a batch boundary on request; the checkpoint is kept
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::CompletedWithFailures | Self::Cancelled
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Enumerating => "enumerating",
            Self::Fetching => "fetching",
            Self::Normalizing => "normalizing",
            Self::Upserting => "upserting",
            Self::Completed => "completed",
            Self::CompletedWithFailures => "completed_with_failures",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// Cooperative cancellation, checked between unit batches.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Options & Outcome
// ============================================================================

/// Per-run settings.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Dataset name, used in logs and the summary
    pub dataset: String,
    /// Units fetched per batch; checkpoint and cancellation granularity
    pub unit_batch_size: usize,
    /// Discard an existing checkpoint (after confirmation)
    pub restart: bool,
    /// Offer the staging merge once the run completes
    pub merge_staging: bool,
}

impl RunOptions {
    pub fn new(dataset: impl Into<String>) -> Self {
        Self::from_config(dataset, &Config::default())
    }

    pub fn from_config(dataset: impl Into<String>, config: &Config) -> Self {
        Self {
            dataset: dataset.into(),
            unit_batch_size: config.sink.unit_batch_size,
            restart: false,
            merge_staging: false,
        }
    }
}

/// Final report of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub run_id: String,
    pub dataset: String,
    pub state: RunState,
    pub units_total: usize,
    /// Units skipped because an earlier run completed them
    pub units_skipped: usize,
    pub units_succeeded: usize,
    pub units_empty: usize,
    pub units_failed: usize,
    pub rows_written: usize,
    pub rows_rejected: usize,
    pub rows_filtered: usize,
    pub batches_committed: usize,
    pub batches_failed: usize,
    /// Staged rows merged into the target, when a merge ran
    pub staging_merged: Option<usize>,
    /// Error from the post-run merge or checkpoint cleanup
    pub staging_error: Option<String>,
    pub failed: Vec<FailedUnit>,
    pub elapsed: Duration,
}

impl RunOutcome {
    fn new(run_id: &str, dataset: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            dataset: dataset.to_string(),
            state: RunState::Pending,
            units_total: 0,
            units_skipped: 0,
            units_succeeded: 0,
            units_empty: 0,
            units_failed: 0,
            rows_written: 0,
            rows_rejected: 0,
            rows_filtered: 0,
            batches_committed: 0,
            batches_failed: 0,
            staging_merged: None,
            staging_error: None,
            failed: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty() || self.batches_failed > 0 || self.staging_error.is_some()
    }

    /// Emit the summary as one structured event.
    pub fn log_summary(&self) {
        info!(
            run_id = %self.run_id,
            dataset = %self.dataset,
            state = %self.state,
            units_total = self.units_total,
            units_skipped = self.units_skipped,
            units_succeeded = self.units_succeeded,
            units_empty = self.units_empty,
            units_failed = self.units_failed,
            rows_written = self.rows_written,
            rows_rejected = self.rows_rejected,
            rows_filtered = self.rows_filtered,
            batches_committed = self.batches_committed,
            batches_failed = self.batches_failed,
            elapsed = %format!("{:.1}s", self.elapsed.as_secs_f64()),
            "Ingestion run finished"
        );
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Ingestion Report: {} ===", self.dataset)?;
        writeln!(f, "Run: {} ({})", self.run_id, self.state)?;
        writeln!(
            f,
            "Units: {} total, {} skipped, {} succeeded, {} empty, {} failed",
            self.units_total, self.units_skipped, self.units_succeeded, self.units_empty, self.units_failed
        )?;
        writeln!(
            f,
            "Rows: {} written, {} rejected, {} outside window",
            self.rows_written, self.rows_rejected, self.rows_filtered
        )?;
        writeln!(
            f,
            "Batches: {} committed, {} failed",
            self.batches_committed, self.batches_failed
        )?;
        if let Some(merged) = self.staging_merged {
            writeln!(f, "Staging: {} rows merged", merged)?;
        }
        if let Some(err) = &self.staging_error {
            writeln!(f, "Staging: {}", err)?;
        }
        writeln!(f, "Elapsed: {:.1}s", self.elapsed.as_secs_f64())?;
        if !self.failed.is_empty() {
            writeln!(f, "Failed units:")?;
            for failure in &self.failed {
                writeln!(f, "  {} [{}] {}", failure.unit_id, failure.stage, failure.reason)?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Run
// ============================================================================

enum UnitResult {
    Normalized(NormalizedUnit),
    Empty,
    Failed(String),
}

/// One ingestion run of one dataset.
pub struct IngestionRun {
    run_id: String,
    options: RunOptions,
    enumerator: UnitEnumerator,
    fetch_options: FetchPoolOptions,
    normalizer: Arc<Normalizer>,
    sink: UpsertSink,
    checkpoint: Arc<dyn CheckpointStore>,
    confirm: Arc<dyn Confirm>,
    state: RunState,
}

impl IngestionRun {
    pub fn new(options: RunOptions, normalizer: Normalizer, sink: UpsertSink) -> Self {
        Self {
            run_id: generate_run_id(),
            options,
            enumerator: UnitEnumerator::new(),
            fetch_options: FetchPoolOptions::default(),
            normalizer: Arc::new(normalizer),
            sink,
            checkpoint: Arc::new(MemoryCheckpoint::new()),
            confirm: Arc::new(AutoConfirm(false)),
            state: RunState::Pending,
        }
    }

    pub fn with_enumerator(mut self, enumerator: UnitEnumerator) -> Self {
        self.enumerator = enumerator;
        self
    }

    pub fn with_fetch_options(mut self, options: FetchPoolOptions) -> Self {
        self.fetch_options = options;
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn with_confirm(mut self, confirm: Arc<dyn Confirm>) -> Self {
        self.confirm = confirm;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, next: RunState) {
        if self.state != next {
            info!(from = %self.state, to = %next, "Run state changed");
            self.state = next;
        }
    }

    /// Enumerate, fetch, normalize and upsert every unit of the dataset.
    ///
    /// Per-unit and per-batch failures end up in the outcome's ledger, as do
    /// errors of the closing staging merge. Only enumeration failure, storage
    /// loss and mid-run checkpoint I/O errors abort.
    pub async fn execute(
        &mut self,
        ids: &dyn IdentifierSource,
        source: Arc<dyn DataSource>,
        cancel: &CancelFlag,
    ) -> Result<RunOutcome, PipelineError> {
        let span = info_span!("ingest", run_id = %self.run_id, dataset = %self.options.dataset);
        let started = Instant::now();

        let result = self.execute_inner(ids, source, cancel).instrument(span).await;
        match result {
            Ok(mut outcome) => {
                outcome.elapsed = started.elapsed();
                outcome.log_summary();
                Ok(outcome)
            }
            Err(e) => {
                error!(run_id = %self.run_id, dataset = %self.options.dataset, error = %e, "Ingestion run aborted");
                Err(e)
            }
        }
    }

    async fn execute_inner(
        &mut self,
        ids: &dyn IdentifierSource,
        source: Arc<dyn DataSource>,
        cancel: &CancelFlag,
    ) -> Result<RunOutcome, PipelineError> {
        let mut outcome = RunOutcome::new(&self.run_id, &self.options.dataset);

        self.transition(RunState::Enumerating);
        let units = self.enumerator.enumerate(ids).await?;
        outcome.units_total = units.len();

        let checkpoint = self.resolve_checkpoint().await?;
        self.sink.prepare().await?;

        let (offset, remaining) = slice_after_checkpoint(&units, checkpoint);
        outcome.units_skipped = offset;
        if offset > 0 {
            info!(skipped = offset, remaining = remaining.len(), "Resuming from checkpoint");
        }

        let pool = FetchPool::new(source, self.fetch_options.clone());
        let batch_size = self.options.unit_batch_size.max(1);
        let mut completed = offset;

        for batch in remaining.chunks(batch_size) {
            if cancel.is_cancelled() {
                warn!(completed, total = units.len(), "Cancellation requested, stopping at batch boundary");
                self.transition(RunState::Cancelled);
                outcome.state = RunState::Cancelled;
                outcome.units_failed = outcome.failed.len();
                return Ok(outcome);
            }

            self.transition(RunState::Fetching);
            let normalizer = Arc::clone(&self.normalizer);
            let results = pool
                .fetch_all_with(batch, move |unit, fetched| match fetched {
                    FetchOutcome::Fetched(records) => {
                        UnitResult::Normalized(normalizer.normalize(unit, &records))
                    }
                    FetchOutcome::Empty => UnitResult::Empty,
                    FetchOutcome::Failed { reason, attempts } => {
                        UnitResult::Failed(format!("{} (after {} attempts)", reason, attempts))
                    }
                })
                .await;

            self.transition(RunState::Normalizing);
            let mut rows = Vec::new();
            let mut fetched_units = Vec::new();
            for (unit, result) in results {
                match result {
                    UnitResult::Normalized(normalized) => {
                        outcome.rows_rejected += normalized.rejected;
                        outcome.rows_filtered += normalized.filtered;
                        rows.extend(normalized.rows);
                        fetched_units.push(unit.id);
                    }
                    UnitResult::Empty => outcome.units_empty += 1,
                    UnitResult::Failed(reason) => outcome.failed.push(FailedUnit {
                        unit_id: unit.id,
                        stage: FailureStage::Fetch,
                        reason,
                    }),
                }
            }

            self.transition(RunState::Upserting);
            let report = self.sink.write(&rows).await?;
            outcome.rows_written += report.rows_written;
            outcome.batches_committed += report.batches_committed;
            outcome.batches_failed += report.batches_failed;

            let sink_failed: HashSet<&str> = report.failed.iter().map(|f| f.unit_id.as_str()).collect();
            outcome.units_succeeded += fetched_units
                .iter()
                .filter(|id| !sink_failed.contains(id.as_str()))
                .count();
            outcome.failed.extend(report.failed);

            completed += batch.len();
            self.checkpoint
                .save(Checkpoint::new(completed - 1))
                .await?;
            info!(completed, total = units.len(), rows = report.rows_written, "Unit batch done");
        }

        outcome.units_failed = outcome.failed.len();

        // Every batch is committed by now; cleanup errors go on the report.
        if let Err(e) = self.checkpoint.clear().await {
            error!(error = %e, "Failed to clear checkpoint");
            outcome.staging_error = Some(format!("checkpoint not cleared: {}", e));
        }

        if self.options.merge_staging && self.sink.is_staging() {
            match self.sink.merge_staging(self.confirm.as_ref()).await {
                Ok(merged) => outcome.staging_merged = merged,
                Err(e) => {
                    error!(error = %e, relation = %self.sink.relation(), "Staging merge failed");
                    outcome.staging_error = Some(format!("merge failed: {}", e));
                }
            }
        }

        let terminal = if outcome.has_failures() {
            RunState::CompletedWithFailures
        } else {
            RunState::Completed
        };
        self.transition(terminal);
        outcome.state = terminal;
        Ok(outcome)
    }

    /// Load the checkpoint, clearing it first when a confirmed restart was
    /// requested. A declined restart resumes.
    async fn resolve_checkpoint(&self) -> Result<Option<Checkpoint>, PipelineError> {
        let existing = self.checkpoint.load().await?;
        let Some(checkpoint) = existing else {
            return Ok(None);
        };

        if self.options.restart {
            let prompt = format!(
                "Discard checkpoint for {} at unit {} and restart from the beginning?",
                self.options.dataset,
                checkpoint.last_completed_index + 1
            );
            if self.confirm.confirm(&prompt).await {
                self.checkpoint.clear().await?;
                info!("Checkpoint discarded, restarting from the first unit");
                return Ok(None);
            }
            info!("Restart declined, resuming from checkpoint");
        }
        Ok(Some(checkpoint))
    }
}

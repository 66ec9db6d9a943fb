//! Keyed upsert sink.
//!
//! The sink is the single writer of a run. Rows are committed in batches of
//! at most `commit_size`; each batch is atomic and merges on the natural
//! key, so re-running any range of units is harmless.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info};

use astock_common::{CommitGranularity, SinkConfig};

use super::confirm::Confirm;
use super::schema::{Row, TableSchema};
use super::{FailedUnit, FailureStage, PipelineError, StorageError};

/// Storage collaborator. Implementations own the SQL dialect.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Create `relation` with the columns and key of `schema` if missing.
    async fn ensure_relation(&self, relation: &str, schema: &TableSchema) -> Result<(), StorageError>;

    /// Insert-or-update `rows` on the schema's natural key, atomically.
    async fn upsert(&self, relation: &str, schema: &TableSchema, rows: &[Row]) -> Result<usize, StorageError>;

    /// Upsert every row of `source` into `target`, atomically.
    async fn merge_relation(
        &self,
        source: &str,
        target: &str,
        schema: &TableSchema,
    ) -> Result<usize, StorageError>;

    async fn drop_relation(&self, relation: &str) -> Result<(), StorageError>;

    async fn count(&self, relation: &str) -> Result<u64, StorageError>;
}

/// Sink settings.
#[derive(Debug, Clone)]
pub struct SinkOptions {
    pub commit_size: usize,
    pub granularity: CommitGranularity,
    /// Write to `<table>_staging` instead of the target
    pub staging: bool,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self::from_config(&SinkConfig::default())
    }
}

impl SinkOptions {
    pub fn from_config(config: &SinkConfig) -> Self {
        Self {
            commit_size: config.commit_size,
            granularity: config.granularity,
            staging: false,
        }
    }

    pub fn with_staging(mut self, staging: bool) -> Self {
        self.staging = staging;
        self
    }
}

/// Result of writing one unit batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkReport {
    pub rows_written: usize,
    pub batches_committed: usize,
    pub batches_failed: usize,
    /// Units that contributed rows to a failed batch
    pub failed: Vec<FailedUnit>,
}

/// Commits normalized rows through a [`Storage`].
pub struct UpsertSink {
    storage: Arc<dyn Storage>,
    schema: TableSchema,
    options: SinkOptions,
}

impl UpsertSink {
    pub fn new(storage: Arc<dyn Storage>, schema: TableSchema, options: SinkOptions) -> Self {
        Self {
            storage,
            schema,
            options,
        }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn is_staging(&self) -> bool {
        self.options.staging
    }

    /// Relation rows are written to.
    pub fn relation(&self) -> String {
        if self.options.staging {
            self.schema.staging_name()
        } else {
            self.schema.name.clone()
        }
    }

    /// Create the target relation, and the staging relation when used.
    pub async fn prepare(&self) -> Result<(), PipelineError> {
        self.storage
            .ensure_relation(&self.schema.name, &self.schema)
            .await?;
        if self.options.staging {
            self.storage
                .ensure_relation(&self.schema.staging_name(), &self.schema)
                .await?;
        }
        Ok(())
    }

    /// Write rows (in unit order) in atomic batches.
    ///
    /// A failed batch is recorded against every unit that contributed rows
    /// to it; earlier batches stay committed and later ones are still
    /// attempted. Only loss of the storage connection aborts.
    pub async fn write(&self, rows: &[Row]) -> Result<SinkReport, PipelineError> {
        let relation = self.relation();
        let mut report = SinkReport::default();

        for batch in self.batches(rows) {
            match self.storage.upsert(&relation, &self.schema, batch).await {
                Ok(written) => {
                    report.rows_written += written;
                    report.batches_committed += 1;
                    debug!(relation = %relation, rows = written, "Committed batch");
                }
                Err(e) if e.is_fatal() => {
                    error!(relation = %relation, error = %e, "Storage unavailable, aborting");
                    return Err(PipelineError::StorageUnavailable(e));
                }
                Err(e) => {
                    let units = contributing_units(batch);
                    error!(
                        relation = %relation,
                        rows = batch.len(),
                        units = ?units,
                        error = %e,
                        "Batch failed"
                    );
                    report.batches_failed += 1;
                    for unit_id in units {
                        if !report.failed.iter().any(|f| f.unit_id == unit_id) {
                            report.failed.push(FailedUnit {
                                unit_id,
                                stage: FailureStage::Sink,
                                reason: e.to_string(),
                            });
                        }
                    }
                }
            }
        }

        Ok(report)
    }

    fn batches<'a>(&self, rows: &'a [Row]) -> Vec<&'a [Row]> {
        let size = self.options.commit_size.max(1);
        match self.options.granularity {
            CommitGranularity::Batch => rows.chunks(size).collect(),
            CommitGranularity::Unit => {
                let mut batches = Vec::new();
                let mut start = 0;
                while start < rows.len() {
                    let unit = &rows[start].unit_id;
                    let end = rows[start..]
                        .iter()
                        .position(|r| &r.unit_id != unit)
                        .map_or(rows.len(), |offset| start + offset);
                    batches.extend(rows[start..end].chunks(size));
                    start = end;
                }
                batches
            }
        }
    }

    /// Ask to merge the staging relation into the target, then ask to drop it.
    ///
    /// Returns the number of merged rows, or `None` when there was nothing to
    /// merge or the operator declined.
    pub async fn merge_staging(&self, confirm: &dyn Confirm) -> Result<Option<usize>, PipelineError> {
        let staging = self.schema.staging_name();
        let target = &self.schema.name;

        let pending = self.storage.count(&staging).await?;
        if pending == 0 {
            info!(staging = %staging, "Staging relation is empty, nothing to merge");
            return Ok(None);
        }

        let prompt = format!("Merge {} staged rows from {} into {}?", pending, staging, target);
        if !confirm.confirm(&prompt).await {
            info!(staging = %staging, rows = pending, "Merge declined, staging left in place");
            return Ok(None);
        }

        let merged = self
            .storage
            .merge_relation(&staging, target, &self.schema)
            .await?;
        info!(staging = %staging, target = %target, rows = merged, "Merged staging into target");

        if confirm.confirm(&format!("Drop staging relation {}?", staging)).await {
            self.storage.drop_relation(&staging).await?;
            info!(staging = %staging, "Dropped staging relation");
        } else {
            info!(staging = %staging, "Staging relation kept");
        }

        Ok(Some(merged))
    }
}

fn contributing_units(batch: &[Row]) -> Vec<String> {
    let mut units: Vec<String> = Vec::new();
    for row in batch {
        if !units.contains(&row.unit_id) {
            units.push(row.unit_id.clone());
        }
    }
    units
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::confirm::AutoConfirm;
    use crate::pipeline::schema::{ColumnSpec, FieldValue};
    use crate::storage::SqliteWarehouse;
    use std::sync::Mutex;

    fn schema() -> TableSchema {
        TableSchema::new(
            "prices",
            vec![
                ColumnSpec::text("symbol"),
                ColumnSpec::integer("day"),
                ColumnSpec::real("close", 2),
            ],
            &["symbol", "day"],
        )
    }

    fn row(unit: &str, day: i64, close: f64) -> Row {
        let mut row = Row::new(unit);
        row.set("symbol", FieldValue::Text(unit.into()));
        row.set("day", FieldValue::Integer(day));
        row.set("close", FieldValue::Real(close));
        row.set(
            crate::pipeline::LAST_UPDATED,
            FieldValue::Timestamp(chrono::Local::now().naive_local()),
        );
        row
    }

    /// Records batch sizes and fails any batch containing a poisoned unit.
    struct RecordingStorage {
        inner: SqliteWarehouse,
        poisoned: Option<&'static str>,
        batch_sizes: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl Storage for RecordingStorage {
        async fn ensure_relation(&self, relation: &str, schema: &TableSchema) -> Result<(), StorageError> {
            self.inner.ensure_relation(relation, schema).await
        }

        async fn upsert(&self, relation: &str, schema: &TableSchema, rows: &[Row]) -> Result<usize, StorageError> {
            self.batch_sizes.lock().unwrap().push(rows.len());
            if let Some(bad) = self.poisoned {
                if rows.iter().any(|r| r.unit_id == bad) {
                    return Err(StorageError::Statement("constraint violation".into()));
                }
            }
            self.inner.upsert(relation, schema, rows).await
        }

        async fn merge_relation(&self, source: &str, target: &str, schema: &TableSchema) -> Result<usize, StorageError> {
            self.inner.merge_relation(source, target, schema).await
        }

        async fn drop_relation(&self, relation: &str) -> Result<(), StorageError> {
            self.inner.drop_relation(relation).await
        }

        async fn count(&self, relation: &str) -> Result<u64, StorageError> {
            self.inner.count(relation).await
        }
    }

    fn recording(poisoned: Option<&'static str>) -> Arc<RecordingStorage> {
        Arc::new(RecordingStorage {
            inner: SqliteWarehouse::open_in_memory().unwrap(),
            poisoned,
            batch_sizes: Mutex::new(Vec::new()),
        })
    }

    fn sink(storage: Arc<RecordingStorage>, commit_size: usize, granularity: CommitGranularity) -> UpsertSink {
        UpsertSink::new(
            storage,
            schema(),
            SinkOptions {
                commit_size,
                granularity,
                staging: false,
            },
        )
    }

    #[tokio::test]
    async fn test_batch_granularity_chunks_across_units() {
        let storage = recording(None);
        let sink = sink(storage.clone(), 2, CommitGranularity::Batch);
        sink.prepare().await.unwrap();

        let rows = vec![row("a", 1, 1.0), row("a", 2, 1.0), row("b", 1, 2.0)];
        let report = sink.write(&rows).await.unwrap();

        assert_eq!(report.rows_written, 3);
        assert_eq!(report.batches_committed, 2);
        assert_eq!(*storage.batch_sizes.lock().unwrap(), vec![2, 1]);
    }

    #[tokio::test]
    async fn test_unit_granularity_never_mixes_units() {
        let storage = recording(None);
        let sink = sink(storage.clone(), 10, CommitGranularity::Unit);
        sink.prepare().await.unwrap();

        let rows = vec![row("a", 1, 1.0), row("a", 2, 1.0), row("b", 1, 2.0)];
        sink.write(&rows).await.unwrap();

        assert_eq!(*storage.batch_sizes.lock().unwrap(), vec![2, 1]);
    }

    #[tokio::test]
    async fn test_failed_batch_is_isolated() {
        let storage = recording(Some("b"));
        let sink = sink(storage.clone(), 1, CommitGranularity::Unit);
        sink.prepare().await.unwrap();

        let rows = vec![row("a", 1, 1.0), row("b", 1, 2.0), row("b", 2, 2.0), row("c", 1, 3.0)];
        let report = sink.write(&rows).await.unwrap();

        assert_eq!(report.batches_committed, 2);
        assert_eq!(report.batches_failed, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].unit_id, "b");
        assert_eq!(report.failed[0].stage, FailureStage::Sink);
        assert_eq!(storage.count("prices").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_staging_merge_and_drop_need_confirmation() {
        let storage = recording(None);
        let staged = UpsertSink::new(
            storage.clone(),
            schema(),
            SinkOptions::default().with_staging(true),
        );
        staged.prepare().await.unwrap();
        assert_eq!(staged.relation(), "prices_staging");

        staged.write(&[row("a", 1, 1.0), row("b", 1, 2.0)]).await.unwrap();

        assert_eq!(staged.merge_staging(&AutoConfirm(false)).await.unwrap(), None);
        assert_eq!(storage.count("prices").await.unwrap(), 0);
        assert_eq!(storage.count("prices_staging").await.unwrap(), 2);

        assert_eq!(staged.merge_staging(&AutoConfirm(true)).await.unwrap(), Some(2));
        assert_eq!(storage.count("prices").await.unwrap(), 2);
        assert!(storage.count("prices_staging").await.is_err());
    }
}

//! Progress checkpoints.
//!
//! A checkpoint records the index of the last work unit whose batch was
//! fully processed. A resumed run skips units `0..=last_completed_index`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use super::{DateRange, PipelineError};

/// Persisted progress marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_completed_index: usize,
}

impl Checkpoint {
    pub fn new(last_completed_index: usize) -> Self {
        Self {
            last_completed_index,
        }
    }
}

/// Storage port for run checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self) -> Result<Option<Checkpoint>, PipelineError>;
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), PipelineError>;
    async fn clear(&self) -> Result<(), PipelineError>;
}

// ============================================================================
// File Checkpoint
// ============================================================================

/// One JSON file per dataset and window: `{"last_completed_index": N}`.
#[derive(Debug, Clone)]
pub struct FileCheckpoint {
    path: PathBuf,
}

impl FileCheckpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<dir>/<dataset>.json`, or `<dir>/<dataset>_<start>-<end>.json` for
    /// a windowed run. Unit indices only mean something for the window that
    /// enumerated them.
    pub fn for_run(dir: &Path, dataset: &str, range: Option<DateRange>) -> Self {
        let name = match range {
            Some(range) => format!(
                "{}_{}-{}.json",
                dataset,
                range.start().format("%Y%m%d"),
                range.end().format("%Y%m%d")
            ),
            None => format!("{}.json", dataset),
        };
        Self::new(dir.join(name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn checkpoint_error(path: &Path, action: &str, err: impl std::fmt::Display) -> PipelineError {
    PipelineError::Checkpoint(format!("failed to {} {}: {}", action, path.display(), err))
}

#[async_trait]
impl CheckpointStore for FileCheckpoint {
    async fn load(&self) -> Result<Option<Checkpoint>, PipelineError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(checkpoint_error(&self.path, "read", e)),
        };
        let checkpoint = serde_json::from_str(&content)
            .map_err(|e| checkpoint_error(&self.path, "parse", e))?;
        Ok(Some(checkpoint))
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), PipelineError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| checkpoint_error(parent, "create", e))?;
        }
        let content = serde_json::to_string(&checkpoint)
            .map_err(|e| checkpoint_error(&self.path, "encode", e))?;

        // Write-then-rename so a crash never leaves a truncated file.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| checkpoint_error(&tmp, "write", e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| checkpoint_error(&self.path, "replace", e))?;

        debug!(
            path = %self.path.display(),
            last_completed_index = checkpoint.last_completed_index,
            "Checkpoint saved"
        );
        Ok(())
    }

    async fn clear(&self) -> Result<(), PipelineError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(checkpoint_error(&self.path, "remove", e)),
        }
    }
}

// ============================================================================
// Memory Checkpoint
// ============================================================================

/// In-process checkpoint, for tests and runs with checkpointing disabled.
#[derive(Debug, Default)]
pub struct MemoryCheckpoint {
    current: Mutex<Option<Checkpoint>>,
    saves: Mutex<Vec<Checkpoint>>,
}

impl MemoryCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing checkpoint.
    pub fn starting_at(checkpoint: Checkpoint) -> Self {
        Self {
            current: Mutex::new(Some(checkpoint)),
            saves: Mutex::new(Vec::new()),
        }
    }

    pub fn current(&self) -> Option<Checkpoint> {
        self.current.lock().map(|c| *c).unwrap_or(None)
    }

    /// Every checkpoint saved so far, oldest first.
    pub fn saves(&self) -> Vec<Checkpoint> {
        self.saves.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

fn poisoned() -> PipelineError {
    PipelineError::Checkpoint("checkpoint lock poisoned".into())
}

#[async_trait]
impl CheckpointStore for MemoryCheckpoint {
    async fn load(&self) -> Result<Option<Checkpoint>, PipelineError> {
        Ok(*self.current.lock().map_err(|_| poisoned())?)
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), PipelineError> {
        *self.current.lock().map_err(|_| poisoned())? = Some(checkpoint);
        self.saves.lock().map_err(|_| poisoned())?.push(checkpoint);
        Ok(())
    }

    async fn clear(&self) -> Result<(), PipelineError> {
        *self.current.lock().map_err(|_| poisoned())? = None;
        Ok(())
    }
}

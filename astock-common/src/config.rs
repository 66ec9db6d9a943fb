//! Configuration management for the warehouse ingesters.
//!
//! All ingesters share one configuration file at `~/.astock/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (ASTOCK_* prefix)
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `ASTOCK_DB_PATH` → database.path
//! - `ASTOCK_PROVIDER_URL` → provider.base_url
//! - `ASTOCK_MAX_WORKERS` → fetch.max_workers
//! - `ASTOCK_COMMIT_SIZE` → sink.commit_size
//! - `ASTOCK_LOG_LEVEL` → observability.log_level
//! - `ASTOCK_LOG_FORMAT` → observability.log_format

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result, ResultExt};

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".astock"),
        |dirs| dirs.home_dir().join(".astock"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

// ============================================================================
// Database
// ============================================================================

/// Warehouse database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite warehouse file. `~` is expanded.
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl DatabaseConfig {
    /// Database path with `~` expanded.
    pub fn resolved_path(&self) -> PathBuf {
        expand_path(&self.path)
    }
}

fn default_db_path() -> String {
    "~/.astock/warehouse.db".into()
}

// ============================================================================
// Provider
// ============================================================================

/// Upstream data provider (AKTools HTTP server) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL of the AKTools server
    #[serde(default = "default_provider_url")]
    pub base_url: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_provider_url(),
            timeout_secs: default_provider_timeout(),
        }
    }
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_provider_url() -> String {
    "http://127.0.0.1:8080".into()
}

fn default_provider_timeout() -> u64 {
    30
}

// ============================================================================
// Fetch pool
// ============================================================================

/// Fetch pool configuration: concurrency, pacing and retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Maximum number of simultaneous in-flight fetches
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Lower bound of the per-worker pause after each fetch (ms)
    #[serde(default = "default_pacing_min_ms")]
    pub pacing_min_ms: u64,

    /// Upper bound of the per-worker pause after each fetch (ms)
    #[serde(default = "default_pacing_max_ms")]
    pub pacing_max_ms: u64,

    /// Attempts per unit before it is marked failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Fixed backoff between attempts (ms)
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Optional base seed for the per-worker pacing RNG.
    /// Worker `i` is seeded with `seed + i`; unset means entropy.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            pacing_min_ms: default_pacing_min_ms(),
            pacing_max_ms: default_pacing_max_ms(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            seed: None,
        }
    }
}

impl FetchConfig {
    pub fn pacing_min(&self) -> Duration {
        Duration::from_millis(self.pacing_min_ms)
    }

    pub fn pacing_max(&self) -> Duration {
        Duration::from_millis(self.pacing_max_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

fn default_max_workers() -> usize {
    6
}

fn default_pacing_min_ms() -> u64 {
    300
}

fn default_pacing_max_ms() -> u64 {
    600
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    1000
}

// ============================================================================
// Sink
// ============================================================================

/// How many rows are committed atomically together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitGranularity {
    /// Rows of all units in a unit batch are chunked together
    #[default]
    Batch,
    /// Each unit's rows are chunked on their own
    Unit,
}

impl std::fmt::Display for CommitGranularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Batch => write!(f, "batch"),
            Self::Unit => write!(f, "unit"),
        }
    }
}

/// Upsert sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Maximum rows per atomic commit
    #[serde(default = "default_commit_size")]
    pub commit_size: usize,

    /// Commit granularity
    #[serde(default)]
    pub granularity: CommitGranularity,

    /// Work units fetched per batch (checkpoint and cancellation boundary)
    #[serde(default = "default_unit_batch_size")]
    pub unit_batch_size: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            commit_size: default_commit_size(),
            granularity: CommitGranularity::default(),
            unit_batch_size: default_unit_batch_size(),
        }
    }
}

fn default_commit_size() -> usize {
    1000
}

fn default_unit_batch_size() -> usize {
    300
}

// ============================================================================
// Date window
// ============================================================================

/// Default inclusive date window applied when the CLI does not give one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WindowConfig {
    /// First date kept (inclusive). Unset means no lower bound.
    #[serde(default)]
    pub start_date: Option<NaiveDate>,

    /// Last date kept (inclusive). Unset means today.
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
}

// ============================================================================
// Checkpoint
// ============================================================================

/// Progress checkpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Persist progress after every unit batch
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Directory holding one checkpoint file per dataset. `~` is expanded.
    #[serde(default = "default_checkpoint_dir")]
    pub dir: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_checkpoint_dir(),
        }
    }
}

impl CheckpointConfig {
    pub fn resolved_dir(&self) -> PathBuf {
        expand_path(&self.dir)
    }
}

fn default_checkpoint_dir() -> String {
    "~/.astock/checkpoints".into()
}

// ============================================================================
// Market classification
// ============================================================================

/// Exchange classification by code prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    /// Shanghai Stock Exchange code prefixes (→ `sh`)
    #[serde(default = "default_sse_prefixes")]
    pub sse_prefixes: Vec<String>,

    /// Shenzhen Stock Exchange code prefixes (→ `sz`)
    #[serde(default = "default_szse_prefixes")]
    pub szse_prefixes: Vec<String>,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            sse_prefixes: default_sse_prefixes(),
            szse_prefixes: default_szse_prefixes(),
        }
    }
}

fn default_sse_prefixes() -> Vec<String> {
    ["600", "601", "603", "605", "688", "689"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_szse_prefixes() -> Vec<String> {
    ["000", "001", "002", "003", "300", "301"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

// ============================================================================
// Observability
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Root
// ============================================================================

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(default)]
    pub sink: SinkConfig,

    #[serde(default)]
    pub window: WindowConfig,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    #[serde(default)]
    pub markets: MarketConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the default path, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .context(format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .context(format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration (default path or `path`) with environment overrides.
    pub fn load_with_env(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load_from(p)?,
            None => Self::load()?,
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply `ASTOCK_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    ///
    /// Runs before logging is set up, so a value that fails to parse is an
    /// error rather than a warning.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("ASTOCK_DB_PATH") {
            self.database.path = path;
        }
        if let Some(url) = lookup("ASTOCK_PROVIDER_URL") {
            self.provider.base_url = url;
        }
        if let Some(raw) = lookup("ASTOCK_MAX_WORKERS") {
            self.fetch.max_workers = parse_count("ASTOCK_MAX_WORKERS", &raw)?;
        }
        if let Some(raw) = lookup("ASTOCK_COMMIT_SIZE") {
            self.sink.commit_size = parse_count("ASTOCK_COMMIT_SIZE", &raw)?;
        }
        if let Some(level) = lookup("ASTOCK_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Some(format) = lookup("ASTOCK_LOG_FORMAT") {
            self.observability.log_format = format;
        }
        Ok(())
    }
}

fn parse_count(key: &str, raw: &str) -> Result<usize> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} must be a non-negative integer, got '{}'", key, raw)))
}

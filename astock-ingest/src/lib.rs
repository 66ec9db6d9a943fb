//! Astock Ingest Library
//!
//! Idempotent, incremental ingestion of A-share market data from an AKTools
//! server into a local SQLite warehouse.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       astock-ingest run <dataset>                │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  datasets     endpoint + unit source + schema + normalizer rules │
//! │  pipeline     enumerate → fetch pool → normalize → upsert sink   │
//! │  provider     AKTools HTTP client (DataSource, IdentifierSource) │
//! │  storage      SQLite warehouse (Storage)                         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Concepts
//!
//! - **Work unit**: one symbol, report period or market fetched as a whole
//! - **Natural key**: the columns identifying a row; writes merge on it, so
//!   re-running any range of units leaves the warehouse unchanged
//! - **Checkpoint**: index of the last completed unit, written after every
//!   unit batch so an interrupted run resumes where it stopped

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod datasets;
pub mod pipeline;
pub mod provider;
pub mod storage;

pub use datasets::{catalog, find, Dataset, UnitSource};
pub use pipeline::{IngestionRun, PipelineError, RunOptions, RunOutcome, RunState};
pub use storage::SqliteWarehouse;

//! Astock Common - shared configuration, logging, and error types for the
//! A-share warehouse ingesters.
//!
//! This crate provides:
//! - Configuration types and loading (`~/.astock/config.json` + `ASTOCK_*` overrides)
//! - Configuration validation
//! - Error types and handling utilities
//! - Logging setup and structured logging helpers

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;
pub mod validation;

pub use config::{
    CheckpointConfig, CommitGranularity, Config, DatabaseConfig, FetchConfig, MarketConfig, ObservabilityConfig,
    ProviderConfig, SinkConfig, WindowConfig,
};
pub use error::{Error, Result};
pub use validation::{Validate, ValidationError, ValidationResult};

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::logging::init_logging;
    pub use crate::validation::{Validate, ValidationError};
}

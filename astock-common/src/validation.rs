//! Configuration validation.
//!
//! Rejects values that would make a run meaningless (no workers, no
//! attempts, empty commits) before any fetch is issued.

use thiserror::Error;

use crate::config::{
    Config, FetchConfig, MarketConfig, ObservabilityConfig, ProviderConfig, SinkConfig,
    WindowConfig,
};

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Configuration conflict: {reason}")]
    Conflict { reason: String },

    #[error("Multiple validation errors: {0:?}")]
    Multiple(Vec<ValidationError>),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Trait for validatable configuration sections.
pub trait Validate {
    /// Validate this configuration section.
    fn validate(&self) -> ValidationResult<()>;
}

impl Config {
    /// Validate the entire configuration.
    pub fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        let sections: [&dyn Validate; 6] = [
            &self.provider,
            &self.fetch,
            &self.sink,
            &self.window,
            &self.markets,
            &self.observability,
        ];
        for section in sections {
            if let Err(e) = section.validate() {
                errors.push(e);
            }
        }

        if self.database.path.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "database.path".into(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else if errors.len() == 1 {
            Err(errors.remove(0))
        } else {
            Err(ValidationError::Multiple(errors))
        }
    }

    /// Load, apply environment overrides, and validate.
    pub fn load_and_validate(path: Option<&std::path::Path>) -> crate::Result<Self> {
        let config = Self::load_with_env(path)?;
        config.validate()?;
        Ok(config)
    }
}

impl Validate for ProviderConfig {
    fn validate(&self) -> ValidationResult<()> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ValidationError::InvalidValue {
                field: "provider.base_url".into(),
                reason: format!("'{}' is not an http(s) URL", self.base_url),
            });
        }
        if self.timeout_secs == 0 {
            return Err(ValidationError::InvalidValue {
                field: "provider.timeout_secs".into(),
                reason: "must be greater than 0".into(),
            });
        }
        Ok(())
    }
}

impl Validate for FetchConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.max_workers == 0 {
            return Err(ValidationError::InvalidValue {
                field: "fetch.max_workers".into(),
                reason: "must be greater than 0".into(),
            });
        }
        if self.max_attempts == 0 {
            return Err(ValidationError::InvalidValue {
                field: "fetch.max_attempts".into(),
                reason: "must be greater than 0".into(),
            });
        }
        if self.pacing_min_ms > self.pacing_max_ms {
            return Err(ValidationError::Conflict {
                reason: format!(
                    "fetch.pacing_min_ms ({}) exceeds fetch.pacing_max_ms ({})",
                    self.pacing_min_ms, self.pacing_max_ms
                ),
            });
        }
        Ok(())
    }
}

impl Validate for SinkConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.commit_size == 0 {
            return Err(ValidationError::InvalidValue {
                field: "sink.commit_size".into(),
                reason: "must be greater than 0".into(),
            });
        }
        if self.unit_batch_size == 0 {
            return Err(ValidationError::InvalidValue {
                field: "sink.unit_batch_size".into(),
                reason: "must be greater than 0".into(),
            });
        }
        Ok(())
    }
}

impl Validate for WindowConfig {
    fn validate(&self) -> ValidationResult<()> {
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if start > end {
                return Err(ValidationError::Conflict {
                    reason: format!("window.start_date {} is after window.end_date {}", start, end),
                });
            }
        }
        Ok(())
    }
}

impl Validate for MarketConfig {
    fn validate(&self) -> ValidationResult<()> {
        let all = self.sse_prefixes.iter().chain(self.szse_prefixes.iter());
        for prefix in all {
            if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_digit()) {
                return Err(ValidationError::InvalidValue {
                    field: "markets".into(),
                    reason: format!("prefix '{}' must be a non-empty digit string", prefix),
                });
            }
        }
        if let Some(shared) = self
            .sse_prefixes
            .iter()
            .find(|p| self.szse_prefixes.contains(p))
        {
            return Err(ValidationError::Conflict {
                reason: format!("prefix '{}' is assigned to both exchanges", shared),
            });
        }
        Ok(())
    }
}

impl Validate for ObservabilityConfig {
    fn validate(&self) -> ValidationResult<()> {
        const LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
        if !LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ValidationError::InvalidValue {
                field: "observability.log_level".into(),
                reason: format!("'{}' is not one of {:?}", self.log_level, LEVELS),
            });
        }
        if self.log_format != "json" && self.log_format != "pretty" {
            return Err(ValidationError::InvalidValue {
                field: "observability.log_format".into(),
                reason: format!("'{}' must be 'json' or 'pretty'", self.log_format),
            });
        }
        Ok(())
    }
}

//! Error types shared across the crate.
//!
//! Runtime failures (target, stage) never escape a run: the executor folds
//! them into the [`Outcome`](crate::outcome::Outcome). Catalog and config
//! errors are returned to the caller at load time.

use std::time::Duration;

/// Failures reported by a [`TargetHandle`](crate::target::TargetHandle).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Failure of one phase of one technique.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    #[error("{technique}: state capture failed: {reason}")]
    Capture { technique: String, reason: String },
    #[error("{technique}: apply failed: {reason}")]
    Apply { technique: String, reason: String },
    #[error("{technique}: rollback failed: {reason}")]
    Rollback { technique: String, reason: String },
    #[error("verification failed: {0}")]
    Verification(String),
    #[error("{technique}: {source}")]
    Target {
        technique: String,
        #[source]
        source: TargetError,
    },
}

impl StageError {
    pub fn capture(technique: &str, reason: impl Into<String>) -> Self {
        Self::Capture {
            technique: technique.to_string(),
            reason: reason.into(),
        }
    }

    pub fn apply(technique: &str, reason: impl Into<String>) -> Self {
        Self::Apply {
            technique: technique.to_string(),
            reason: reason.into(),
        }
    }

    pub fn rollback(technique: &str, reason: impl Into<String>) -> Self {
        Self::Rollback {
            technique: technique.to_string(),
            reason: reason.into(),
        }
    }

    pub fn target(technique: &str, source: TargetError) -> Self {
        Self::Target {
            technique: technique.to_string(),
            source,
        }
    }
}

/// Catalog loading and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to read catalog: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse catalog: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("duplicate technique name: {0}")]
    DuplicateTechnique(String),
    #[error("technique {name}: success weight {weight} outside [0, 1]")]
    WeightOutOfRange { name: String, weight: f64 },
    #[error("template {template} references unknown technique {technique}")]
    UnknownTechnique { template: String, technique: String },
    #[error("template {template} lists technique {technique} more than once")]
    DuplicateTemplateEntry { template: String, technique: String },
    #[error("default template {0} is not defined")]
    MissingDefaultTemplate(String),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

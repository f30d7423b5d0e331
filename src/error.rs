use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Batch not found: {0}")]
    BatchNotFound(String),

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Metadata ids exhausted")]
    IdsExhausted,

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("Scene error: {0}")]
    Scene(#[from] SceneError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Failures raised inside a task body or while validating a submission.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskError {
    /// Missing or misnamed pool/trait, or a reference cycle.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("no eligible candidate for trait `{trait_name}` in pool `{pool}`")]
    NoEligibleCandidate { trait_name: String, pool: String },

    /// I/O or scene mutation failure. The only retryable kind.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
}

impl TaskError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::Configuration(_) => ErrorKind::Configuration,
            TaskError::NoEligibleCandidate { .. } => ErrorKind::NoEligibleCandidate,
            TaskError::Transient(_) => ErrorKind::Transient,
            TaskError::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            TaskError::SchemaValidation(_) => ErrorKind::SchemaValidation,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<std::io::Error> for TaskError {
    fn from(err: std::io::Error) -> Self {
        TaskError::Transient(err.to_string())
    }
}

impl From<SceneError> for TaskError {
    fn from(err: SceneError) -> Self {
        match err {
            SceneError::UnknownTrait(name) => {
                TaskError::Configuration(format!("scene has no trait named `{name}`"))
            }
            apply @ SceneError::Apply { .. } => TaskError::Configuration(apply.to_string()),
            other => TaskError::Transient(other.to_string()),
        }
    }
}

impl From<ExportError> for TaskError {
    fn from(err: ExportError) -> Self {
        match err {
            ExportError::CapabilityMissing(format) => TaskError::UnsupportedFormat(format),
            other => TaskError::Transient(other.to_string()),
        }
    }
}

/// Classifies a job failure for retry decisions and for the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Configuration,
    NoEligibleCandidate,
    Transient,
    UnsupportedFormat,
    SchemaValidation,
}

impl ErrorKind {
    /// Same name the kind serializes to.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Configuration => "CONFIGURATION",
            ErrorKind::NoEligibleCandidate => "NO_ELIGIBLE_CANDIDATE",
            ErrorKind::Transient => "TRANSIENT",
            ErrorKind::UnsupportedFormat => "UNSUPPORTED_FORMAT",
            ErrorKind::SchemaValidation => "SCHEMA_VALIDATION",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Configuration => write!(f, "ConfigurationError"),
            ErrorKind::NoEligibleCandidate => write!(f, "NoEligibleCandidateError"),
            ErrorKind::Transient => write!(f, "TransientExecutionError"),
            ErrorKind::UnsupportedFormat => write!(f, "UnsupportedFormatError"),
            ErrorKind::SchemaValidation => write!(f, "SchemaValidationError"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SceneError {
    #[error("scene has no trait named `{0}`")]
    UnknownTrait(String),

    #[error("value `{value}` cannot be applied to `{trait_name}`")]
    Apply { trait_name: String, value: String },

    #[error("no checkpoint to revert to")]
    NoCheckpoint,

    #[error("failed to load scene: {0}")]
    Load(String),
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("exporter for `{0}` is not available in this environment")]
    CapabilityMissing(String),

    #[error("exporter exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("exporter did not produce {0}")]
    MissingArtifact(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

//! Error types for demo-forge operations.
//!
//! Defines the error types shared across subsystems:
//! - Stage execution failures (terminal for a run)
//! - Job registry lookups and lifecycle transitions
//! - Snapshot, template and job metadata persistence

use thiserror::Error;

/// Classification of a stage failure, recorded on the job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The state handed to the stage lacked required keys or had bad values.
    InvalidInput,
    /// An external service (LLM endpoint, data warehouse) failed.
    External,
    /// The stage failed internally.
    Internal,
    /// The stage exceeded its time budget.
    Timeout,
    /// The stage returned without producing the keys its contract promises.
    MissingOutput,
    /// The stage panicked.
    Panicked,
    /// The orchestration machinery itself failed (scheduling, registry).
    Infrastructure,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::InvalidInput => write!(f, "invalid_input"),
            FailureKind::External => write!(f, "external"),
            FailureKind::Internal => write!(f, "internal"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::MissingOutput => write!(f, "missing_output"),
            FailureKind::Panicked => write!(f, "panicked"),
            FailureKind::Infrastructure => write!(f, "infrastructure"),
        }
    }
}

/// Errors a stage surfaces to the orchestrator.
///
/// Any of these is terminal for the run. Retryable external-call failures
/// are expected to be absorbed inside the stage before one of these is
/// returned.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Missing required input keys: {}", missing.join(", "))]
    InvalidInput { missing: Vec<String> },

    #[error("Invalid input: {0}")]
    InvalidValue(String),

    #[error("External service error: {0}")]
    External(String),

    #[error("{0}")]
    Internal(String),

    #[error("Stage timed out after {seconds:.1} seconds")]
    Timeout { seconds: f64 },

    #[error("Stage did not produce required output keys: {}", missing.join(", "))]
    MissingOutput { missing: Vec<String> },

    #[error("Stage panicked: {0}")]
    Panicked(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StageError {
    /// Returns the failure classification for this error.
    pub fn kind(&self) -> FailureKind {
        match self {
            StageError::InvalidInput { .. } | StageError::InvalidValue(_) => {
                FailureKind::InvalidInput
            }
            StageError::External(_) => FailureKind::External,
            StageError::Internal(_) | StageError::Json(_) => FailureKind::Internal,
            StageError::Timeout { .. } => FailureKind::Timeout,
            StageError::MissingOutput { .. } => FailureKind::MissingOutput,
            StageError::Panicked(_) => FailureKind::Panicked,
        }
    }
}

/// Errors that can occur during job registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Job '{0}' not found")]
    NotFound(String),

    #[error("Invalid transition for job '{job_id}' from '{from}' to '{to}'")]
    InvalidTransition {
        job_id: String,
        from: String,
        to: String,
    },

    #[error("Job '{0}' is already in a terminal state")]
    AlreadyTerminal(String),

    #[error("Stage index {index} out of range for job '{job_id}'")]
    UnknownStage { job_id: String, index: usize },
}

/// Errors that can occur during snapshot, template and job metadata persistence.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error(
        "Snapshot '{run_label}/{stage_label}' not found (available runs: [{}]; stages for '{run_label}': [{}])",
        available_runs.join(", "),
        available_stages.join(", ")
    )]
    NotFound {
        run_label: String,
        stage_label: String,
        available_runs: Vec<String>,
        available_stages: Vec<String>,
    },

    #[error("Template '{name}' not found (available: [{}])", available.join(", "))]
    TemplateNotFound { name: String, available: Vec<String> },

    #[error("No persisted metadata for job '{0}'")]
    JobNotFound(String),

    #[error("Snapshot '{run_label}/{stage_label}' already exists")]
    AlreadyExists {
        run_label: String,
        stage_label: String,
    },

    #[error("Invalid label '{0}': must be non-empty and contain only alphanumeric characters, hyphens, underscores and dots")]
    InvalidLabel(String),

    #[error("Invalid snapshot data in '{path}': {reason}")]
    InvalidData { path: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

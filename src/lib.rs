//! demo-forge: orchestration core of a multi-stage demo generator.
//!
//! This library runs a fixed sequence of long-running stages as background
//! jobs, reports per-stage progress to polling clients, and captures the
//! pipeline state after every stage so any stage can be replayed alone.

// Core modules
pub mod cli;
pub mod error;
pub mod pipeline;
pub mod scheduler;
pub mod service;
pub mod storage;

// Re-export commonly used types
pub use error::{FailureKind, RegistryError, StageError, StorageError};
pub use pipeline::{Orchestrator, PipelineConfig, PipelineState, Stage, StageContract};
pub use scheduler::{BackgroundRunner, JobId, JobRecord, JobRegistry, JobStatus};
pub use service::{DemoService, JobStatusView, RunRequest, ServiceError};

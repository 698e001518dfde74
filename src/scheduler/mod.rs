//! Job tracking and background execution.
//!
//! This module provides the process-wide job infrastructure:
//!
//! - **JobRecord**: Lifecycle, progress, per-stage status and log tail of a run
//! - **JobRegistry**: In-memory registry with per-job locks, retention and
//!   write-behind persistence
//! - **BackgroundRunner**: Spawns one task per job and tracks it until it ends
//!
//! # Architecture
//!
//! ```text
//!    ┌──────────────┐   create()   ┌──────────────┐
//!    │ DemoService  ├─────────────►│ JobRegistry  │◄──── status queries
//!    └──────┬───────┘              └──────▲───────┘
//!           │ schedule()                  │ update()
//!    ┌──────▼───────┐   spawn      ┌──────┴───────┐
//!    │BackgroundRun.├─────────────►│ Orchestrator │
//!    └──────────────┘              └──────────────┘
//! ```

pub mod job;
pub mod registry;
pub mod runner;

// Re-export main types for convenience
pub use job::{JobId, JobRecord, JobStatus, LogEntry, StageState, StageStatus};
pub use registry::JobRegistry;
pub use runner::{BackgroundRunner, RunnerError, RunnerStats, ShutdownReport};

//! File-based persistence.
//!
//! # Overview
//!
//! The storage layer consists of:
//! - **Snapshots**: Pipeline state captured after each stage, per run
//! - **Fixtures**: Snapshot and template loading for isolated stage runs
//! - **Metadata**: One file per job for crash visibility and inspection
//!
//! All writes go through a temp-file-then-rename step, so readers never see
//! a partially written file.
//!
//! # Usage
//!
//! ```rust,ignore
//! use demo_forge::storage::{FixtureLoader, SnapshotStore};
//!
//! let store = SnapshotStore::new("./snapshots");
//! store.capture("run-1", "research", &state).await?;
//!
//! let loader = FixtureLoader::new("./snapshots", "./templates");
//! let state = loader.replay(&narrative_stage, "run-1", "research").await?;
//! ```

pub mod atomic;
pub mod fixtures;
pub mod metadata;
pub mod snapshots;

// Re-export main types for convenience
pub use fixtures::{FixtureLoader, ReplayError};
pub use metadata::{JobMetadataStore, PersistedJob};
pub use snapshots::{CapturedStage, RunManifest, Snapshot, SnapshotStore};

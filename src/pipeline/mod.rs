//! Pipeline orchestration for demo generation.
//!
//! This module provides the stage abstraction and the machinery that runs a
//! fixed stage sequence for one job.
//!
//! # Architecture
//!
//! - **State**: Versioned key/value store threaded through every stage
//! - **Stage**: Uniform `execute(state) -> state` contract plus a boundary
//!   contract listing required and produced keys
//! - **Stages**: The default seven-stage sequence and a simulated stand-in
//! - **Orchestrator**: Runs the sequence, updates the job record and
//!   captures snapshots
//! - **Config**: Configuration for all pipeline components
//!
//! # Pipeline Flow
//!
//! 1. **research**: Customer URL to company profile
//! 2. **narrative**: Demo title, story and golden queries
//! 3. **modeling**: Warehouse schema
//! 4. **data_synthesis**: Synthetic data files
//! 5. **provisioning**: Dataset and tables
//! 6. **instructions**: Presenter instructions
//! 7. **validation**: Golden queries checked against the dataset
//!
//! A stage failure is terminal for the run; no later stage executes.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use demo_forge::pipeline::{simulated_pipeline, Orchestrator, PipelineConfig, PipelineState};
//! use demo_forge::scheduler::JobRegistry;
//!
//! let config = PipelineConfig::new().with_snapshot_dir("./snapshots");
//! let registry = Arc::new(JobRegistry::new(&config));
//! let orchestrator = Orchestrator::new(
//!     simulated_pipeline(Duration::from_millis(50)),
//!     Arc::clone(&registry),
//!     config,
//! );
//!
//! let job_id = registry.create().await;
//! let state = PipelineState::new().with("customer_url", "https://example.com");
//! let outcome = orchestrator.run(state, job_id).await;
//! println!("{} finished as {}", job_id, outcome.status);
//! ```

pub mod config;
pub mod orchestrator;
pub mod stage;
pub mod stages;
pub mod state;

// Re-export main types for convenience
pub use config::{ConfigError, PipelineConfig};
pub use orchestrator::{Orchestrator, RunOutcome};
pub use stage::{Stage, StageContract};
pub use stages::{
    contract_for, default_contract, default_contracts, simulated_pipeline, SimulatedStage,
    CONTEXT_KEYS, CUSTOMER_URL_KEY, DEFAULT_STAGE_SEQUENCE,
};
pub use state::PipelineState;

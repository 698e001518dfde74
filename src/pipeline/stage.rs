//! The stage abstraction consumed by the orchestrator.
//!
//! A stage is a named unit of work with a uniform contract: it takes the
//! pipeline state by value, and either returns the state it produced or a
//! [`StageError`]. Concrete stages (research, narrative design, schema
//! modeling, data synthesis, provisioning, ...) live outside this crate's
//! core; the orchestrator treats them polymorphically through [`Stage`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StageError;

use super::state::PipelineState;

/// Keys a stage reads and writes at its boundary.
///
/// Contracts document the boundary between consecutive stages. Stages call
/// [`check_inputs`](Self::check_inputs) to reject an incomplete state; the
/// orchestrator calls [`check_outputs`](Self::check_outputs) on the merged
/// state after a stage returns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageContract {
    /// Name of the stage this contract belongs to.
    pub stage: String,
    /// Keys that must be present before the stage runs.
    pub requires: Vec<String>,
    /// Keys the stage reads when present.
    pub optional: Vec<String>,
    /// Keys that must be present after the stage returns.
    pub produces: Vec<String>,
}

impl StageContract {
    /// Creates an empty contract for the named stage.
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            ..Default::default()
        }
    }

    pub fn requires(mut self, keys: &[&str]) -> Self {
        self.requires.extend(keys.iter().map(|k| k.to_string()));
        self
    }

    pub fn optional(mut self, keys: &[&str]) -> Self {
        self.optional.extend(keys.iter().map(|k| k.to_string()));
        self
    }

    pub fn produces(mut self, keys: &[&str]) -> Self {
        self.produces.extend(keys.iter().map(|k| k.to_string()));
        self
    }

    /// Fails with [`StageError::InvalidInput`] if any required key is absent.
    pub fn check_inputs(&self, state: &PipelineState) -> Result<(), StageError> {
        let missing = missing_from(state, &self.requires);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(StageError::InvalidInput { missing })
        }
    }

    /// Fails with [`StageError::MissingOutput`] if any produced key is absent.
    pub fn check_outputs(&self, state: &PipelineState) -> Result<(), StageError> {
        let missing = missing_from(state, &self.produces);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(StageError::MissingOutput { missing })
        }
    }
}

fn missing_from(state: &PipelineState, keys: &[String]) -> Vec<String> {
    keys.iter()
        .filter(|k| !state.contains_key(k))
        .cloned()
        .collect()
}

/// A unit of the fixed pipeline sequence.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stable stage name, used for job records and snapshot labels.
    fn name(&self) -> &str;

    /// Boundary contract for this stage. Defaults to an empty contract.
    fn contract(&self) -> StageContract {
        StageContract::new(self.name())
    }

    /// Per-stage timeout overriding the pipeline-wide default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Runs the stage on the given state.
    ///
    /// The returned state is merged into the running state by the
    /// orchestrator, so a stage may return only the keys it wrote.
    async fn execute(&self, state: PipelineState) -> Result<PipelineState, StageError>;
}

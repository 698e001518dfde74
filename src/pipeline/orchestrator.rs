//! Pipeline orchestrator for demo-generation runs.
//!
//! The orchestrator owns the fixed stage sequence and, for one job at a
//! time, coordinates:
//! - Threading the pipeline state through each stage in order
//! - Per-stage timeouts and panic isolation
//! - Job record updates (stage status, progress, log lines)
//! - Snapshot capture after every successful stage
//!
//! A run never fails past this boundary: whatever happens, the job record is
//! left in a terminal state and a [`RunOutcome`] is returned. Every call into
//! a stage, including its name, contract and timeout lookups, runs under
//! panic isolation.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde_json::Map;
use tracing::{debug, error, info, warn};

use crate::error::{FailureKind, RegistryError, StageError};
use crate::scheduler::job::{JobId, JobStatus};
use crate::scheduler::registry::JobRegistry;
use crate::storage::snapshots::SnapshotStore;

use super::config::PipelineConfig;
use super::stage::Stage;
use super::state::PipelineState;

/// Result of running the stage sequence for one job.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Job the run belonged to.
    pub job_id: JobId,
    /// Terminal status reached by the run.
    pub status: JobStatus,
    /// State after the last successful stage.
    pub state: PipelineState,
    /// Name of the stage that failed, if any.
    pub failed_stage: Option<String>,
    /// Failure message, if the run failed.
    pub error: Option<String>,
    /// Wall-clock duration of the run.
    pub duration: Duration,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Completed
    }
}

/// Runs the fixed stage sequence for jobs held in a [`JobRegistry`].
pub struct Orchestrator {
    stages: Vec<Arc<dyn Stage>>,
    registry: Arc<JobRegistry>,
    snapshots: Option<Arc<SnapshotStore>>,
    config: PipelineConfig,
}

impl Orchestrator {
    /// Creates an orchestrator for the given stage sequence.
    ///
    /// Snapshots are captured under `config.snapshot_dir` when it is set.
    pub fn new(
        stages: Vec<Arc<dyn Stage>>,
        registry: Arc<JobRegistry>,
        config: PipelineConfig,
    ) -> Self {
        let snapshots = config.snapshot_dir.as_ref().map(|dir| {
            Arc::new(SnapshotStore::new(dir).with_overwrite(config.overwrite_snapshots))
        });

        Self {
            stages,
            registry,
            snapshots,
            config,
        }
    }

    /// Names of the stages, in execution order.
    ///
    /// A stage whose `name()` panics is listed as `stage-<position>`.
    pub fn stage_names(&self) -> Vec<String> {
        self.stages
            .iter()
            .enumerate()
            .map(|(index, stage)| {
                std::panic::catch_unwind(AssertUnwindSafe(|| stage.name().to_string()))
                    .unwrap_or_else(|_| format!("stage-{}", index + 1))
            })
            .collect()
    }

    pub fn stages(&self) -> &[Arc<dyn Stage>] {
        &self.stages
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn snapshot_store(&self) -> Option<&Arc<SnapshotStore>> {
        self.snapshots.as_ref()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs every stage for `job_id`, starting from `initial_state`.
    ///
    /// The job must exist in the registry in `pending` status. The first
    /// stage failure stops the sequence and fails the job; later stages do
    /// not run.
    pub async fn run(&self, initial_state: PipelineState, job_id: JobId) -> RunOutcome {
        let started = Instant::now();
        let total = self.stages.len();
        let names = self.stage_names();

        if let Err(e) = self.registry.start(&job_id, &names).await {
            error!(job_id = %job_id, error = %e, "Failed to start job");
            let message = format!("failed to start job: {}", e);
            self.note(
                &job_id,
                "fail",
                self.registry
                    .fail(&job_id, &message, FailureKind::Infrastructure)
                    .await,
            );
            return RunOutcome {
                job_id,
                status: JobStatus::Failed,
                state: initial_state,
                failed_stage: None,
                error: Some(message),
                duration: started.elapsed(),
            };
        }

        self.log(&job_id, None, format!("Pipeline started with {} stages", total))
            .await;

        let mut state = initial_state;

        for (index, stage) in self.stages.iter().enumerate() {
            let name = names[index].clone();

            self.note(
                &job_id,
                "begin_stage",
                self.registry.begin_stage(&job_id, index).await,
            );
            self.log(&job_id, Some(&name), "Stage started").await;

            let stage_started = Instant::now();
            match self.execute_stage(stage.as_ref(), &state).await {
                Ok(merged) => {
                    state = merged;
                    let duration_ms = stage_started.elapsed().as_millis() as u64;
                    debug!(
                        job_id = %job_id,
                        stage = %name,
                        duration_ms = duration_ms,
                        version = state.version(),
                        "Stage completed"
                    );

                    self.capture_snapshot(&job_id, &name, &state).await;

                    let progress = ((index + 1) * 100 / total) as u8;
                    self.note(
                        &job_id,
                        "complete_stage",
                        self.registry.complete_stage(&job_id, index, progress).await,
                    );
                    self.log(
                        &job_id,
                        Some(&name),
                        format!("Stage completed in {} ms", duration_ms),
                    )
                    .await;
                }
                Err(e) => {
                    let message = e.to_string();
                    let kind = e.kind();
                    self.log(
                        &job_id,
                        Some(&name),
                        format!("Stage failed ({}): {}", kind, message),
                    )
                    .await;
                    self.note(
                        &job_id,
                        "fail_stage",
                        self.registry
                            .fail_stage(&job_id, index, &message, kind)
                            .await,
                    );

                    return RunOutcome {
                        job_id,
                        status: JobStatus::Failed,
                        state,
                        failed_stage: Some(name),
                        error: Some(message),
                        duration: started.elapsed(),
                    };
                }
            }
        }

        let summary = self.summary(&state);
        self.note(
            &job_id,
            "complete",
            self.registry.complete(&job_id, summary).await,
        );
        self.log(&job_id, None, "Pipeline completed").await;

        info!(
            job_id = %job_id,
            stages = total,
            duration_ms = started.elapsed().as_millis() as u64,
            "Pipeline run finished"
        );

        RunOutcome {
            job_id,
            status: JobStatus::Completed,
            state,
            failed_stage: None,
            error: None,
            duration: started.elapsed(),
        }
    }

    /// Executes one stage and merges its output into a copy of `state`.
    ///
    /// A panic anywhere in the stage, including its timeout and contract
    /// lookups, becomes `StageError::Panicked`.
    async fn execute_stage(
        &self,
        stage: &dyn Stage,
        state: &PipelineState,
    ) -> Result<PipelineState, StageError> {
        let default_timeout = self.config.stage_timeout;

        let guarded = AssertUnwindSafe(async move {
            let execution = stage.execute(state.clone());
            let output = match stage.timeout().or(default_timeout) {
                Some(limit) => tokio::time::timeout(limit, execution)
                    .await
                    .map_err(|_| StageError::Timeout {
                        seconds: limit.as_secs_f64(),
                    })??,
                None => execution.await?,
            };

            let merged = state.clone().merged(output);
            stage.contract().check_outputs(&merged)?;
            Ok::<_, StageError>(merged)
        })
        .catch_unwind();

        match guarded.await {
            Ok(result) => result,
            Err(panic) => Err(StageError::Panicked(panic_message(panic.as_ref()))),
        }
    }

    async fn capture_snapshot(&self, job_id: &JobId, stage: &str, state: &PipelineState) {
        let Some(store) = &self.snapshots else {
            return;
        };

        if let Err(e) = store.capture(&job_id.to_string(), stage, state).await {
            warn!(job_id = %job_id, stage = %stage, error = %e, "Failed to capture snapshot");
            self.log(job_id, Some(stage), format!("Snapshot not captured: {}", e))
                .await;
        }
    }

    fn summary(&self, state: &PipelineState) -> Map<String, serde_json::Value> {
        self.config
            .summary_keys
            .iter()
            .filter_map(|key| state.get(key).map(|value| (key.clone(), value.clone())))
            .collect()
    }

    async fn log(&self, job_id: &JobId, stage: Option<&str>, message: impl Into<String>) {
        if let Err(e) = self.registry.log(job_id, stage, message).await {
            warn!(job_id = %job_id, error = %e, "Failed to append job log line");
        }
    }

    fn note(&self, job_id: &JobId, operation: &str, result: Result<(), RegistryError>) {
        if let Err(e) = result {
            error!(job_id = %job_id, operation = operation, error = %e, "Job registry update failed");
        }
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

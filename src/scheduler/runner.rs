//! Background execution of pipeline runs.
//!
//! The runner decouples accepting a run from executing it. Each scheduled
//! job gets its own tokio task; the task's `JoinHandle` is held in a handle
//! registry until the task finishes and evicts itself.
//!
//! # Features
//!
//! - Returns to the caller as soon as the task is spawned
//! - Panics escaping the orchestrator are caught and recorded as failures
//! - A job is never left `running` once its task has exited
//! - Graceful shutdown: stop accepting, drain up to a timeout, abort the rest

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{FailureKind, RegistryError};
use crate::pipeline::orchestrator::{panic_message, Orchestrator, RunOutcome};
use crate::pipeline::state::PipelineState;

use super::job::{JobId, JobStatus};
use super::registry::JobRegistry;

/// Message recorded on jobs whose task was aborted by [`BackgroundRunner::shutdown`].
pub const ABORTED_MESSAGE: &str = "aborted during shutdown";

/// Errors that can occur when scheduling work.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The runner no longer accepts new jobs.
    #[error("Background runner is shutting down")]
    ShuttingDown,

    /// The job could not be looked up or updated.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Statistics about the runner.
#[derive(Debug, Clone, Default)]
pub struct RunnerStats {
    /// Number of tasks currently tracked.
    pub in_flight: usize,
    /// Total number of jobs scheduled.
    pub scheduled: u64,
    /// Jobs that finished as completed.
    pub completed: u64,
    /// Jobs that finished as failed, including aborted ones.
    pub failed: u64,
    /// Jobs aborted during shutdown.
    pub aborted: u64,
}

/// Outcome of [`BackgroundRunner::shutdown`].
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    /// Tasks that finished within the timeout.
    pub drained: usize,
    /// Jobs whose tasks were aborted.
    pub aborted: Vec<JobId>,
}

struct SharedRunnerStats {
    scheduled: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    aborted: AtomicU64,
}

impl SharedRunnerStats {
    fn new() -> Self {
        Self {
            scheduled: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
        }
    }

    fn record_status(&self, status: JobStatus) {
        match status {
            JobStatus::Completed => self.completed.fetch_add(1, Ordering::SeqCst),
            _ => self.failed.fetch_add(1, Ordering::SeqCst),
        };
    }
}

type HandleMap = Arc<Mutex<HashMap<JobId, JoinHandle<()>>>>;

fn lock_handles(handles: &Mutex<HashMap<JobId, JoinHandle<()>>>) -> MutexGuard<'_, HashMap<JobId, JoinHandle<()>>> {
    handles.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs orchestrator jobs as independent tokio tasks.
pub struct BackgroundRunner {
    orchestrator: Arc<Orchestrator>,
    registry: Arc<JobRegistry>,
    handles: HandleMap,
    accepting: AtomicBool,
    stats: Arc<SharedRunnerStats>,
}

impl BackgroundRunner {
    /// Creates a runner executing jobs with `orchestrator`.
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let registry = Arc::clone(orchestrator.registry());
        Self {
            orchestrator,
            registry,
            handles: Arc::new(Mutex::new(HashMap::new())),
            accepting: AtomicBool::new(true),
            stats: Arc::new(SharedRunnerStats::new()),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Schedules the run of `job_id` and returns without waiting for it.
    ///
    /// # Errors
    ///
    /// Returns `RunnerError::ShuttingDown` after [`shutdown`](Self::shutdown)
    /// was called; the job is marked failed in that case. Returns
    /// `RunnerError::Registry` if the job does not exist.
    pub async fn schedule(
        &self,
        job_id: JobId,
        initial_state: PipelineState,
    ) -> Result<(), RunnerError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return self.reject(&job_id).await;
        }

        if !self.registry.contains(&job_id).await {
            return Err(RegistryError::NotFound(job_id.to_string()).into());
        }

        let orchestrator = Arc::clone(&self.orchestrator);
        let registry = Arc::clone(&self.registry);
        let handles = Arc::clone(&self.handles);
        let stats = Arc::clone(&self.stats);

        // `accepting` is re-checked under the handle lock, which shutdown
        // also holds while it flips the flag and drains, so every spawned
        // task is seen by shutdown. Holding the lock across the spawn also
        // keeps the task from evicting its handle before it was inserted.
        let spawned = {
            let mut tracked = lock_handles(&self.handles);
            if self.accepting.load(Ordering::SeqCst) {
                let handle = tokio::spawn(async move {
                    run_job(orchestrator, registry, stats, job_id, initial_state).await;
                    lock_handles(&handles).remove(&job_id);
                });
                tracked.insert(job_id, handle);
                true
            } else {
                false
            }
        };
        if !spawned {
            return self.reject(&job_id).await;
        }

        self.stats.scheduled.fetch_add(1, Ordering::SeqCst);
        debug!(job_id = %job_id, "Scheduled job");
        Ok(())
    }

    async fn reject(&self, job_id: &JobId) -> Result<(), RunnerError> {
        error!(job_id = %job_id, "Rejecting job, runner is shutting down");
        if let Err(e) = self
            .registry
            .fail(
                job_id,
                "background runner is shutting down; job was not scheduled",
                FailureKind::Infrastructure,
            )
            .await
        {
            error!(job_id = %job_id, error = %e, "Failed to mark rejected job as failed");
        }
        Err(RunnerError::ShuttingDown)
    }

    /// Number of tasks still tracked.
    pub fn in_flight(&self) -> usize {
        lock_handles(&self.handles).len()
    }

    /// Returns true if `job_id` has a live task.
    pub fn is_tracked(&self, job_id: &JobId) -> bool {
        lock_handles(&self.handles).contains_key(job_id)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> RunnerStats {
        RunnerStats {
            in_flight: self.in_flight(),
            scheduled: self.stats.scheduled.load(Ordering::SeqCst),
            completed: self.stats.completed.load(Ordering::SeqCst),
            failed: self.stats.failed.load(Ordering::SeqCst),
            aborted: self.stats.aborted.load(Ordering::SeqCst),
        }
    }

    /// Stops accepting work and drains in-flight tasks.
    ///
    /// Tasks still running after `timeout` are aborted and their jobs are
    /// marked failed.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        let pending: Vec<(JobId, JoinHandle<()>)> = {
            let mut tracked = lock_handles(&self.handles);
            self.accepting.store(false, Ordering::SeqCst);
            tracked.drain().collect()
        };
        info!(in_flight = pending.len(), "Shutting down background runner");

        let deadline = tokio::time::Instant::now() + timeout;
        let mut report = ShutdownReport::default();

        for (job_id, mut handle) in pending {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => report.drained += 1,
                Ok(Err(e)) => {
                    error!(job_id = %job_id, error = %e, "Job task failed during shutdown");
                    report.drained += 1;
                }
                Err(_) => {
                    handle.abort();
                    // Wait for the cancellation so the task cannot write after us.
                    let _ = handle.await;
                    report.aborted.push(job_id);
                }
            }
        }

        for job_id in &report.aborted {
            warn!(job_id = %job_id, "Aborted job during shutdown");
            self.stats.aborted.fetch_add(1, Ordering::SeqCst);
            match self
                .registry
                .fail(job_id, ABORTED_MESSAGE, FailureKind::Infrastructure)
                .await
            {
                Ok(()) => {
                    self.stats.failed.fetch_add(1, Ordering::SeqCst);
                }
                Err(RegistryError::AlreadyTerminal(_)) => {}
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "Failed to mark aborted job as failed")
                }
            }
            if let Err(e) = self.registry.log(job_id, None, ABORTED_MESSAGE).await {
                warn!(job_id = %job_id, error = %e, "Failed to append job log line");
            }
        }

        info!(
            drained = report.drained,
            aborted = report.aborted.len(),
            "Background runner shutdown complete"
        );
        report
    }
}

async fn run_job(
    orchestrator: Arc<Orchestrator>,
    registry: Arc<JobRegistry>,
    stats: Arc<SharedRunnerStats>,
    job_id: JobId,
    initial_state: PipelineState,
) {
    supervise(&registry, &stats, job_id, orchestrator.run(initial_state, job_id)).await;
}

/// Drives `run` to completion and makes sure the job ends terminal.
///
/// A panic escaping `run`, or a run that returns while the record is still
/// pending or running, fails the job with an "internal error" message.
async fn supervise<F>(registry: &JobRegistry, stats: &SharedRunnerStats, job_id: JobId, run: F)
where
    F: Future<Output = RunOutcome>,
{
    let result = AssertUnwindSafe(run).catch_unwind().await;

    let panic = match result {
        Ok(outcome) => {
            debug!(
                job_id = %job_id,
                status = %outcome.status,
                duration_ms = outcome.duration.as_millis() as u64,
                "Job task finished"
            );
            None
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(job_id = %job_id, panic = %message, "Job task panicked");
            Some(message)
        }
    };

    match registry.get(&job_id).await {
        Ok(record) if !record.is_terminal() => {
            let message = match panic {
                Some(panic) => format!("internal error: {}", panic),
                None => "internal error: run ended without a terminal status".to_string(),
            };
            if let Err(e) = registry
                .fail(&job_id, &message, FailureKind::Infrastructure)
                .await
            {
                error!(job_id = %job_id, error = %e, "Failed to mark job as failed");
            }
            stats.record_status(JobStatus::Failed);
        }
        Ok(record) => stats.record_status(record.status),
        Err(e) => {
            error!(job_id = %job_id, error = %e, "Job record missing after run");
            stats.record_status(JobStatus::Failed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::config::PipelineConfig;
    use crate::pipeline::stage::{Stage, StageContract};
    use crate::pipeline::stages::SimulatedStage;

    fn runner_with(stages: Vec<Arc<dyn Stage>>) -> (BackgroundRunner, Arc<JobRegistry>) {
        let config = PipelineConfig::new();
        let registry = Arc::new(JobRegistry::new(&config));
        let orchestrator = Arc::new(Orchestrator::new(stages, Arc::clone(&registry), config));
        (BackgroundRunner::new(orchestrator), registry)
    }

    fn slow_stage(delay: Duration) -> Arc<dyn Stage> {
        Arc::new(SimulatedStage::new(StageContract::new("slow").produces(&["x"])).with_delay(delay))
    }

    async fn wait_terminal(registry: &JobRegistry, job_id: &JobId) -> JobStatus {
        for _ in 0..200 {
            let record = registry.get(job_id).await.expect("record");
            if record.is_terminal() {
                return record.status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached a terminal status", job_id);
    }

    #[tokio::test]
    async fn test_schedule_returns_before_completion() {
        let (runner, registry) = runner_with(vec![slow_stage(Duration::from_millis(100))]);
        let job_id = registry.create().await;

        runner
            .schedule(job_id, PipelineState::new())
            .await
            .expect("schedule");
        assert!(runner.is_tracked(&job_id));
        assert!(!registry.get(&job_id).await.expect("record").is_terminal());

        assert_eq!(wait_terminal(&registry, &job_id).await, JobStatus::Completed);

        // The task evicts its own handle.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runner.in_flight(), 0);
        let stats = runner.stats();
        assert_eq!(stats.scheduled, 1);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn test_schedule_unknown_job() {
        let (runner, _registry) = runner_with(vec![slow_stage(Duration::ZERO)]);
        assert!(matches!(
            runner.schedule(JobId::new(), PipelineState::new()).await,
            Err(RunnerError::Registry(RegistryError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_aborts_stragglers() {
        let (runner, registry) = runner_with(vec![slow_stage(Duration::from_secs(30))]);
        let job_id = registry.create().await;
        runner
            .schedule(job_id, PipelineState::new())
            .await
            .expect("schedule");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = runner.shutdown(Duration::from_millis(50)).await;
        assert_eq!(report.aborted, vec![job_id]);
        assert_eq!(runner.in_flight(), 0);

        let record = registry.get(&job_id).await.expect("record");
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.error.as_deref(), Some(ABORTED_MESSAGE));
        assert_eq!(record.failure_kind, Some(FailureKind::Infrastructure));
        assert_eq!(runner.stats().aborted, 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains_fast_jobs() {
        let (runner, registry) = runner_with(vec![slow_stage(Duration::from_millis(20))]);
        let job_id = registry.create().await;
        runner
            .schedule(job_id, PipelineState::new())
            .await
            .expect("schedule");

        let report = runner.shutdown(Duration::from_secs(5)).await;
        assert!(report.aborted.is_empty());
        assert_eq!(
            registry.get(&job_id).await.expect("record").status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_schedule_after_shutdown_fails_job() {
        let (runner, registry) = runner_with(vec![slow_stage(Duration::ZERO)]);
        runner.shutdown(Duration::from_millis(10)).await;
        assert!(!runner.is_accepting());

        let job_id = registry.create().await;
        assert!(matches!(
            runner.schedule(job_id, PipelineState::new()).await,
            Err(RunnerError::ShuttingDown)
        ));

        let record = registry.get(&job_id).await.expect("record");
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.failure_kind, Some(FailureKind::Infrastructure));
    }

    fn finished_outcome(job_id: JobId) -> RunOutcome {
        RunOutcome {
            job_id,
            status: JobStatus::Completed,
            state: PipelineState::new(),
            failed_stage: None,
            error: None,
            duration: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_supervise_fails_job_on_escaped_panic() {
        let registry = JobRegistry::new(&PipelineConfig::new());
        let stats = SharedRunnerStats::new();
        let job_id = registry.create().await;
        registry.start(&job_id, &["research"]).await.expect("start");
        registry.begin_stage(&job_id, 0).await.expect("begin");

        let run = futures::future::lazy(|_| -> RunOutcome { panic!("lost track of the job") });
        supervise(&registry, &stats, job_id, run).await;

        let record = registry.get(&job_id).await.expect("record");
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.failure_kind, Some(FailureKind::Infrastructure));
        assert_eq!(
            record.error.as_deref(),
            Some("internal error: lost track of the job")
        );
        assert_eq!(stats.failed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_supervise_fails_job_left_running() {
        let registry = JobRegistry::new(&PipelineConfig::new());
        let stats = SharedRunnerStats::new();
        let job_id = registry.create().await;
        registry.start(&job_id, &["research"]).await.expect("start");

        // Claims success but never completed the record.
        supervise(&registry, &stats, job_id, async move { finished_outcome(job_id) }).await;

        let record = registry.get(&job_id).await.expect("record");
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.failure_kind, Some(FailureKind::Infrastructure));
        assert!(record
            .error
            .as_deref()
            .is_some_and(|e| e.starts_with("internal error:")));
        assert_eq!(stats.completed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_supervise_leaves_terminal_records_alone() {
        let registry = JobRegistry::new(&PipelineConfig::new());
        let stats = SharedRunnerStats::new();
        let job_id = registry.create().await;
        registry.start(&job_id, &["research"]).await.expect("start");
        registry
            .complete(&job_id, serde_json::Map::new())
            .await
            .expect("complete");

        supervise(&registry, &stats, job_id, async move { finished_outcome(job_id) }).await;

        let record = registry.get(&job_id).await.expect("record");
        assert_eq!(record.status, JobStatus::Completed);
        assert!(record.error.is_none());
        assert_eq!(stats.completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shutdown_racing_schedule_leaves_no_job_running() {
        let (runner, registry) = runner_with(vec![slow_stage(Duration::from_secs(30))]);
        let runner = Arc::new(runner);

        let mut ids = Vec::new();
        for _ in 0..32 {
            ids.push(registry.create().await);
        }

        let mut handles = Vec::new();
        for job_id in ids.clone() {
            let runner = Arc::clone(&runner);
            handles.push(tokio::spawn(async move {
                let _ = runner.schedule(job_id, PipelineState::new()).await;
            }));
        }
        tokio::task::yield_now().await;
        runner.shutdown(Duration::from_millis(10)).await;
        for handle in handles {
            handle.await.expect("join");
        }

        // Each job was either rejected or aborted by shutdown.
        assert_eq!(runner.in_flight(), 0);
        for job_id in &ids {
            let record = registry.get(job_id).await.expect("record");
            assert_eq!(record.status, JobStatus::Failed, "job {} escaped shutdown", job_id);
        }
    }

    #[tokio::test]
    async fn test_concurrent_jobs_are_isolated() {
        let stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(
                SimulatedStage::new(StageContract::new("a").produces(&["a_out"]))
                    .with_delay(Duration::from_millis(10)),
            ),
            Arc::new(
                SimulatedStage::new(StageContract::new("b").produces(&["b_out"]))
                    .with_delay(Duration::from_millis(10)),
            ),
        ];
        let (runner, registry) = runner_with(stages);

        let mut ids = Vec::new();
        for _ in 0..5 {
            let job_id = registry.create().await;
            runner
                .schedule(job_id, PipelineState::new())
                .await
                .expect("schedule");
            ids.push(job_id);
        }

        for job_id in &ids {
            assert_eq!(wait_terminal(&registry, job_id).await, JobStatus::Completed);
            let record = registry.get(job_id).await.expect("record");
            assert_eq!(record.id, *job_id);
            assert_eq!(record.stages.len(), 2);
        }
    }
}

//! Run-creation and status-query surface.
//!
//! [`DemoService`] is what a transport layer (HTTP handler, CLI) talks to:
//!
//! - `create_run` validates a request, registers a job, schedules it in the
//!   background and returns the job id immediately
//! - `status` returns a serializable view of one job, or `NotFound`
//! - `list_jobs` returns one summary line per known job

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::error::{FailureKind, RegistryError};
use crate::pipeline::config::PipelineConfig;
use crate::pipeline::orchestrator::Orchestrator;
use crate::pipeline::stage::Stage;
use crate::pipeline::stages::{CONTEXT_KEYS, CUSTOMER_URL_KEY};
use crate::pipeline::state::PipelineState;
use crate::scheduler::job::{JobId, JobRecord, JobStatus, LogEntry, StageStatus};
use crate::scheduler::registry::JobRegistry;
use crate::scheduler::runner::{BackgroundRunner, RunnerError, ShutdownReport};

/// Errors surfaced to clients of the service.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// No job with this id is known.
    #[error("Job '{0}' not found")]
    NotFound(String),

    /// The request was rejected before a job was created.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Runner error: {0}")]
    Runner(#[from] RunnerError),
}

/// A request to generate a demo for one customer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    /// Customer website the research stage starts from.
    pub customer_url: String,
    /// Optional rich context, copied into the initial state as-is.
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl RunRequest {
    pub fn new(customer_url: impl Into<String>) -> Self {
        Self {
            customer_url: customer_url.into(),
            context: Map::new(),
        }
    }

    /// Adds a context entry, e.g. `industry_hint` or `target_audience`.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Checks the request and builds the initial pipeline state.
    pub fn into_initial_state(self) -> Result<PipelineState, ServiceError> {
        let url = self.customer_url.trim();
        validate_url(url)?;

        let mut state = PipelineState::new().with(CUSTOMER_URL_KEY, url);
        for (key, value) in self.context {
            if key.trim().is_empty() {
                return Err(ServiceError::InvalidRequest(
                    "context keys must not be empty".to_string(),
                ));
            }
            if key == CUSTOMER_URL_KEY {
                return Err(ServiceError::InvalidRequest(format!(
                    "context must not override '{}'",
                    CUSTOMER_URL_KEY
                )));
            }
            if !CONTEXT_KEYS.contains(&key.as_str()) {
                debug!(key = %key, "Passing through non-standard context key");
            }
            state.insert(key, value);
        }
        Ok(state)
    }
}

fn validate_url(url: &str) -> Result<(), ServiceError> {
    let host = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| {
            ServiceError::InvalidRequest(format!(
                "customer_url must start with http:// or https://, got '{}'",
                url
            ))
        })?;

    let host = host.split(['/', '?', '#']).next().unwrap_or_default();
    if host.is_empty() || host.contains(char::is_whitespace) {
        return Err(ServiceError::InvalidRequest(format!(
            "customer_url has no valid host: '{}'",
            url
        )));
    }
    Ok(())
}

/// Client-facing view of one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub current_stage: Option<String>,
    pub progress: u8,
    pub stages: Vec<StageStatus>,
    pub logs: Vec<LogEntry>,
    pub result: Map<String, Value>,
    pub error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub recovered: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobStatusView {
    /// Builds the view of `record` with at most `log_tail` log lines.
    ///
    /// A job that has not started yet lists `stage_names` as not started.
    pub fn from_record(record: &JobRecord, log_tail: usize, stage_names: &[String]) -> Self {
        let stages = if record.stages.is_empty() && record.status == JobStatus::Pending {
            stage_names
                .iter()
                .map(|name| StageStatus::not_started(name.as_str()))
                .collect()
        } else {
            record.stages.clone()
        };

        Self {
            job_id: record.id,
            status: record.status,
            current_stage: record.current_stage.clone(),
            progress: record.progress,
            stages,
            logs: record.log_tail(log_tail),
            result: record.result.clone(),
            error: record.error.clone(),
            failure_kind: record.failure_kind,
            recovered: record.recovered,
            created_at: record.created_at,
            updated_at: record.updated_at,
            finished_at: record.finished_at,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// One line of [`DemoService::list_jobs`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub status: JobStatus,
    pub progress: u8,
    pub current_stage: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&JobRecord> for JobSummary {
    fn from(record: &JobRecord) -> Self {
        Self {
            job_id: record.id,
            status: record.status,
            progress: record.progress,
            current_stage: record.current_stage.clone(),
            error: record.error.clone(),
            created_at: record.created_at,
            finished_at: record.finished_at,
        }
    }
}

/// Entry point for creating runs and querying their status.
pub struct DemoService {
    registry: Arc<JobRegistry>,
    runner: Arc<BackgroundRunner>,
    stage_names: Vec<String>,
}

impl DemoService {
    pub fn new(
        registry: Arc<JobRegistry>,
        runner: Arc<BackgroundRunner>,
        stage_names: Vec<String>,
    ) -> Self {
        Self {
            registry,
            runner,
            stage_names,
        }
    }

    /// Wires registry, orchestrator and runner for `stages`.
    ///
    /// The registry recovers persisted jobs when `config.metadata_dir` is set.
    pub async fn bootstrap(config: PipelineConfig, stages: Vec<Arc<dyn Stage>>) -> Self {
        let registry = Arc::new(JobRegistry::init(&config).await);
        let orchestrator = Arc::new(Orchestrator::new(stages, Arc::clone(&registry), config));
        let stage_names = orchestrator.stage_names();
        let runner = Arc::new(BackgroundRunner::new(orchestrator));
        Self::new(registry, runner, stage_names)
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn runner(&self) -> &Arc<BackgroundRunner> {
        &self.runner
    }

    pub fn stage_names(&self) -> &[String] {
        &self.stage_names
    }

    /// Creates and schedules a new run. Every call yields a new job id.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::InvalidRequest` before any job is created if
    /// the request is malformed. Scheduling errors are returned after the
    /// job was created and marked failed.
    pub async fn create_run(&self, request: RunRequest) -> Result<JobId, ServiceError> {
        let url = request.customer_url.trim().to_string();
        let state = request.into_initial_state()?;

        let job_id = self.registry.create().await;
        self.registry
            .log(&job_id, None, format!("Run requested for {}", url))
            .await?;
        self.runner.schedule(job_id, state).await?;

        info!(job_id = %job_id, customer_url = %url, "Run created");
        Ok(job_id)
    }

    /// Returns the status of a job with up to `log_tail` recent log lines.
    pub async fn status(&self, job_id: &JobId, log_tail: usize) -> Result<JobStatusView, ServiceError> {
        match self.registry.get(job_id).await {
            Ok(record) => Ok(JobStatusView::from_record(
                &record,
                log_tail,
                &self.stage_names,
            )),
            Err(RegistryError::NotFound(id)) => Err(ServiceError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Parses `job_id` and returns its status.
    ///
    /// A malformed id is reported as `NotFound`, like any unknown id.
    pub async fn status_by_str(
        &self,
        job_id: &str,
        log_tail: usize,
    ) -> Result<JobStatusView, ServiceError> {
        let id: JobId = job_id
            .parse()
            .map_err(|_| ServiceError::NotFound(job_id.to_string()))?;
        self.status(&id, log_tail).await
    }

    /// Summaries of all known jobs, oldest first.
    pub async fn list_jobs(&self) -> Vec<JobSummary> {
        self.registry
            .list()
            .await
            .iter()
            .map(JobSummary::from)
            .collect()
    }

    /// Drains the runner and flushes job records to disk.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        let report = self.runner.shutdown(timeout).await;
        self.registry.shutdown().await;
        report
    }
}

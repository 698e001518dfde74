//! Job records for demo-generation runs.
//!
//! This module defines the types tracked by the job registry:
//!
//! - `JobId`: Single-use identifier of a run
//! - `JobRecord`: Lifecycle, progress, per-stage status and log tail of a run
//! - `JobStatus` / `StageState`: Overall and per-stage status
//! - `LogEntry`: One line of the bounded rolling log

use std::collections::VecDeque;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{FailureKind, RegistryError};

/// Message recorded on jobs that were still in flight when a previous
/// process stopped.
pub const INTERRUPTED_MESSAGE: &str =
    "job was in progress when the process stopped; outcome unknown";

/// Unique identifier of a job. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Allocates a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Overall status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, not yet picked up by the background runner.
    Pending,
    /// The stage sequence is executing.
    Running,
    /// Every stage succeeded.
    Completed,
    /// A stage or the orchestration machinery failed.
    Failed,
}

impl JobStatus {
    /// Returns true for `Completed` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Status of a single stage within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    NotStarted,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageState::NotStarted => write!(f, "not_started"),
            StageState::Running => write!(f, "running"),
            StageState::Completed => write!(f, "completed"),
            StageState::Failed => write!(f, "failed"),
        }
    }
}

/// Per-stage entry of a job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageStatus {
    pub name: String,
    pub state: StageState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StageStatus {
    pub fn not_started(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: StageState::NotStarted,
            error: None,
            failure_kind: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Wall-clock duration of the stage, once finished.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// One line of a job's rolling log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    pub message: String,
}

/// Tracks one demo-generation run.
///
/// Lifecycle: `pending` -> `running` -> exactly one of `completed` /
/// `failed`. Once terminal, status, progress, stages and result no longer
/// change; only the log may still receive lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub status: JobStatus,
    #[serde(default)]
    pub current_stage: Option<String>,
    /// Overall progress, 0-100. Never decreases; 100 only once completed.
    pub progress: u8,
    #[serde(default)]
    pub stages: Vec<StageStatus>,
    #[serde(default)]
    pub logs: VecDeque<LogEntry>,
    pub log_capacity: usize,
    /// Summary fields copied from the final state on completion.
    #[serde(default)]
    pub result: Map<String, Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub failure_kind: Option<FailureKind>,
    /// Restored from persisted metadata of a previous process.
    #[serde(default)]
    pub recovered: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Creates a pending record.
    pub fn new(id: JobId, log_capacity: usize) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: JobStatus::Pending,
            current_stage: None,
            progress: 0,
            stages: Vec::new(),
            logs: VecDeque::new(),
            log_capacity: log_capacity.max(1),
            result: Map::new(),
            error: None,
            failure_kind: None,
            recovered: false,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Moves a pending job to `running` and lists its stages as not started.
    pub fn start<S: AsRef<str>>(&mut self, stage_names: &[S]) -> Result<(), RegistryError> {
        if self.status != JobStatus::Pending {
            return Err(self.invalid_transition(JobStatus::Running));
        }
        let now = Utc::now();
        self.status = JobStatus::Running;
        self.stages = stage_names
            .iter()
            .map(|name| StageStatus::not_started(name.as_ref()))
            .collect();
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Marks stage `index` as running and makes it the current stage.
    pub fn begin_stage(&mut self, index: usize) -> Result<(), RegistryError> {
        self.ensure_running()?;
        let now = Utc::now();
        let stage = self.stage_mut(index)?;
        stage.state = StageState::Running;
        stage.started_at = Some(now);
        let name = stage.name.clone();
        self.current_stage = Some(name);
        self.updated_at = now;
        Ok(())
    }

    /// Marks stage `index` as completed and advances progress.
    pub fn complete_stage(&mut self, index: usize, progress: u8) -> Result<(), RegistryError> {
        self.ensure_running()?;
        let now = Utc::now();
        let stage = self.stage_mut(index)?;
        stage.state = StageState::Completed;
        stage.finished_at = Some(now);
        self.advance_progress(progress);
        self.updated_at = now;
        Ok(())
    }

    /// Marks stage `index` as failed and the whole job as failed.
    ///
    /// Progress stays at the value reached by the last completed stage.
    pub fn fail_stage(
        &mut self,
        index: usize,
        message: impl Into<String>,
        kind: FailureKind,
    ) -> Result<(), RegistryError> {
        self.ensure_running()?;
        let message = message.into();
        let now = Utc::now();
        let stage = self.stage_mut(index)?;
        stage.state = StageState::Failed;
        stage.error = Some(message.clone());
        stage.failure_kind = Some(kind);
        stage.finished_at = Some(now);
        let name = stage.name.clone();
        self.finish(
            JobStatus::Failed,
            Some(format!("stage '{}' failed: {}", name, message)),
            Some(kind),
        );
        Ok(())
    }

    /// Completes a running job, copying the summary into the record.
    pub fn complete(&mut self, summary: Map<String, Value>) -> Result<(), RegistryError> {
        self.ensure_running()?;
        self.result = summary;
        self.progress = 100;
        self.current_stage = None;
        self.finish(JobStatus::Completed, None, None);
        Ok(())
    }

    /// Fails a pending or running job outside of any stage.
    ///
    /// Any stage still marked running is marked failed with the same message.
    pub fn fail(
        &mut self,
        message: impl Into<String>,
        kind: FailureKind,
    ) -> Result<(), RegistryError> {
        if self.is_terminal() {
            return Err(RegistryError::AlreadyTerminal(self.id.to_string()));
        }
        let message = message.into();
        let now = Utc::now();
        for stage in self
            .stages
            .iter_mut()
            .filter(|s| s.state == StageState::Running)
        {
            stage.state = StageState::Failed;
            stage.error = Some(message.clone());
            stage.failure_kind = Some(kind);
            stage.finished_at = Some(now);
        }
        self.finish(JobStatus::Failed, Some(message), Some(kind));
        Ok(())
    }

    /// Appends a log line, dropping the oldest when over capacity.
    ///
    /// Allowed in every state, including after the job finished.
    pub fn push_log(&mut self, stage: Option<&str>, message: impl Into<String>) {
        self.logs.push_back(LogEntry {
            timestamp: Utc::now(),
            stage: stage.map(str::to_string),
            message: message.into(),
        });
        while self.logs.len() > self.log_capacity {
            self.logs.pop_front();
        }
        self.updated_at = Utc::now();
    }

    /// Returns up to `n` most recent log lines, oldest first.
    pub fn log_tail(&self, n: usize) -> Vec<LogEntry> {
        let skip = self.logs.len().saturating_sub(n);
        self.logs.iter().skip(skip).cloned().collect()
    }

    /// Converts a record restored from a previous process.
    ///
    /// Terminal records are kept as they were. Records that were still in
    /// flight become `failed` with an "outcome unknown" message.
    pub fn into_recovered(mut self) -> Self {
        self.recovered = true;
        if !self.is_terminal() {
            let now = Utc::now();
            for stage in self
                .stages
                .iter_mut()
                .filter(|s| s.state == StageState::Running)
            {
                stage.state = StageState::Failed;
                stage.error = Some(INTERRUPTED_MESSAGE.to_string());
                stage.failure_kind = Some(FailureKind::Infrastructure);
                stage.finished_at = Some(now);
            }
            self.finish(
                JobStatus::Failed,
                Some(INTERRUPTED_MESSAGE.to_string()),
                Some(FailureKind::Infrastructure),
            );
        }
        self
    }

    /// Raises progress to `progress`, capped below 100 until completion.
    fn advance_progress(&mut self, progress: u8) {
        let capped = progress.min(99);
        if capped > self.progress {
            self.progress = capped;
        }
    }

    fn finish(&mut self, status: JobStatus, error: Option<String>, kind: Option<FailureKind>) {
        let now = Utc::now();
        self.status = status;
        self.error = error;
        self.failure_kind = kind;
        self.finished_at = Some(now);
        self.updated_at = now;
    }

    fn ensure_running(&self) -> Result<(), RegistryError> {
        match self.status {
            JobStatus::Running => Ok(()),
            JobStatus::Completed | JobStatus::Failed => {
                Err(RegistryError::AlreadyTerminal(self.id.to_string()))
            }
            JobStatus::Pending => Err(self.invalid_transition(JobStatus::Running)),
        }
    }

    fn stage_mut(&mut self, index: usize) -> Result<&mut StageStatus, RegistryError> {
        let job_id = self.id.to_string();
        self.stages
            .get_mut(index)
            .ok_or(RegistryError::UnknownStage { job_id, index })
    }

    fn invalid_transition(&self, to: JobStatus) -> RegistryError {
        RegistryError::InvalidTransition {
            job_id: self.id.to_string(),
            from: self.status.to_string(),
            to: to.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running_record(stages: &[&str]) -> JobRecord {
        let mut record = JobRecord::new(JobId::new(), 5);
        record.start(stages).expect("pending job starts");
        record
    }

    #[test]
    fn test_job_id_roundtrip_string() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().expect("valid uuid");
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }

    #[test]
    fn test_job_status_display_and_terminal() {
        assert_eq!(JobStatus::Pending.to_string(), "pending");
        assert_eq!(JobStatus::Running.to_string(), "running");
        assert_eq!(JobStatus::Completed.to_string(), "completed");
        assert_eq!(JobStatus::Failed.to_string(), "failed");
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn test_successful_lifecycle() {
        let mut record = running_record(&["a", "b"]);
        assert_eq!(record.status, JobStatus::Running);
        assert_eq!(record.stages.len(), 2);
        assert!(record
            .stages
            .iter()
            .all(|s| s.state == StageState::NotStarted));

        record.begin_stage(0).expect("begin a");
        assert_eq!(record.current_stage.as_deref(), Some("a"));
        record.complete_stage(0, 50).expect("complete a");
        assert_eq!(record.progress, 50);

        record.begin_stage(1).expect("begin b");
        record.complete_stage(1, 100).expect("complete b");
        // 100 is reserved for the completed status.
        assert_eq!(record.progress, 99);

        let mut summary = Map::new();
        summary.insert("dataset_id".to_string(), Value::from("ds"));
        record.complete(summary).expect("complete");

        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.progress, 100);
        assert!(record.current_stage.is_none());
        assert_eq!(record.result.get("dataset_id"), Some(&Value::from("ds")));
        assert!(record.finished_at.is_some());
    }

    #[test]
    fn test_stage_failure_freezes_progress() {
        let mut record = running_record(&["a", "b", "c"]);
        record.begin_stage(0).expect("begin");
        record.complete_stage(0, 33).expect("complete");
        record.begin_stage(1).expect("begin");
        record
            .fail_stage(1, "invalid schema", FailureKind::Internal)
            .expect("fail");

        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.progress, 33);
        assert_eq!(record.current_stage.as_deref(), Some("b"));
        let states: Vec<StageState> = record.stages.iter().map(|s| s.state).collect();
        assert_eq!(
            states,
            vec![
                StageState::Completed,
                StageState::Failed,
                StageState::NotStarted
            ]
        );
        assert_eq!(record.stages[1].error.as_deref(), Some("invalid schema"));
        assert!(record
            .error
            .as_deref()
            .is_some_and(|e| e.contains("stage 'b' failed")));
    }

    #[test]
    fn test_terminal_records_reject_mutation_but_accept_logs() {
        let mut record = running_record(&["a"]);
        record.fail("boom", FailureKind::Infrastructure).expect("fail");

        assert!(matches!(
            record.begin_stage(0),
            Err(RegistryError::AlreadyTerminal(_))
        ));
        assert!(matches!(
            record.complete(Map::new()),
            Err(RegistryError::AlreadyTerminal(_))
        ));
        assert!(matches!(
            record.fail("again", FailureKind::Internal),
            Err(RegistryError::AlreadyTerminal(_))
        ));

        record.push_log(None, "shutting down");
        assert_eq!(record.logs.len(), 1);
    }

    #[test]
    fn test_progress_never_decreases() {
        let mut record = running_record(&["a", "b"]);
        record.begin_stage(0).expect("begin");
        record.complete_stage(0, 60).expect("complete");
        record.begin_stage(1).expect("begin");
        record.complete_stage(1, 10).expect("complete");
        assert_eq!(record.progress, 60);
    }

    #[test]
    fn test_start_requires_pending() {
        let mut record = running_record(&["a"]);
        assert!(matches!(
            record.start(&["a"]),
            Err(RegistryError::InvalidTransition { .. })
        ));

        let mut pending = JobRecord::new(JobId::new(), 5);
        assert!(matches!(
            pending.begin_stage(0),
            Err(RegistryError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_unknown_stage_index() {
        let mut record = running_record(&["a"]);
        assert!(matches!(
            record.begin_stage(3),
            Err(RegistryError::UnknownStage { index: 3, .. })
        ));
    }

    #[test]
    fn test_log_is_bounded() {
        let mut record = JobRecord::new(JobId::new(), 3);
        for i in 0..10 {
            record.push_log(Some("a"), format!("line {}", i));
        }
        assert_eq!(record.logs.len(), 3);
        let messages: Vec<String> = record.log_tail(2).into_iter().map(|l| l.message).collect();
        assert_eq!(messages, vec!["line 8", "line 9"]);
        assert_eq!(record.log_tail(100).len(), 3);
    }

    #[test]
    fn test_fail_marks_running_stage() {
        let mut record = running_record(&["a", "b"]);
        record.begin_stage(0).expect("begin");
        record
            .fail("aborted during shutdown", FailureKind::Infrastructure)
            .expect("fail");
        assert_eq!(record.stages[0].state, StageState::Failed);
        assert_eq!(record.stages[1].state, StageState::NotStarted);
    }

    #[test]
    fn test_into_recovered() {
        let mut in_flight = running_record(&["a"]);
        in_flight.begin_stage(0).expect("begin");
        let recovered = in_flight.into_recovered();
        assert!(recovered.recovered);
        assert_eq!(recovered.status, JobStatus::Failed);
        assert_eq!(recovered.error.as_deref(), Some(INTERRUPTED_MESSAGE));
        assert_eq!(recovered.stages[0].state, StageState::Failed);

        let mut done = running_record(&["a"]);
        done.complete(Map::new()).expect("complete");
        let recovered = done.into_recovered();
        assert_eq!(recovered.status, JobStatus::Completed);
        assert!(recovered.error.is_none());
    }

    #[test]
    fn test_record_serde_roundtrip_keeps_status() {
        let record = running_record(&["a"]);
        let json = serde_json::to_string(&record).expect("serialize");
        assert!(json.contains("\"status\":\"running\""));
        let back: JobRecord = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.id, record.id);
        assert_eq!(back.status, JobStatus::Running);
    }
}

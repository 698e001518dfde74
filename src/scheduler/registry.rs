//! In-memory job registry.
//!
//! The registry owns every [`JobRecord`] of the running process. It is the
//! single source of truth for status queries:
//!
//! - The outer map lock is held only to look up or insert a record, so
//!   updates to different jobs never contend with each other.
//! - Each record sits behind its own lock; readers always get a consistent
//!   clone, never a half-applied transition.
//! - Finished records stay queryable for the configured retention window.
//! - When a metadata directory is configured, each transition is mirrored
//!   to disk (write-behind, failures are logged and ignored) and records of
//!   a previous process are recovered on [`JobRegistry::init`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{FailureKind, RegistryError};
use crate::pipeline::config::PipelineConfig;
use crate::storage::metadata::JobMetadataStore;

use super::job::{JobId, JobRecord, JobStatus};

type SharedRecord = Arc<RwLock<JobRecord>>;

/// Registry of job records keyed by [`JobId`].
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, SharedRecord>>,
    metadata: Option<JobMetadataStore>,
    log_capacity: usize,
    retention: Duration,
}

impl JobRegistry {
    /// Creates an empty registry.
    ///
    /// Records are mirrored to `config.metadata_dir` when set, but nothing is
    /// recovered from it. Use [`init`](Self::init) for recovery.
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            metadata: config.metadata_dir.clone().map(JobMetadataStore::new),
            log_capacity: config.log_capacity,
            retention: config.retention,
        }
    }

    /// Creates a registry and recovers records persisted by a previous
    /// process.
    ///
    /// Terminal records come back unchanged. Records that were still pending
    /// or running are restored as failed with an "outcome unknown" message.
    pub async fn init(config: &PipelineConfig) -> Self {
        let registry = Self::new(config);

        let Some(store) = &registry.metadata else {
            return registry;
        };

        let records = match store.load_records().await {
            Ok(records) => records,
            Err(e) => {
                warn!(
                    path = %store.base_path().display(),
                    error = %e,
                    "Failed to read persisted job metadata, starting empty"
                );
                return registry;
            }
        };

        let mut interrupted = Vec::new();
        let mut recovered = Vec::with_capacity(records.len());
        for record in records {
            if !record.is_terminal() {
                interrupted.push(record.id);
            }
            recovered.push(record.into_recovered());
        }

        {
            let mut jobs = registry.jobs.write().await;
            for record in &recovered {
                jobs.insert(record.id, Arc::new(RwLock::new(record.clone())));
            }
        }

        // Persist the rewritten status of interrupted jobs.
        for record in recovered.iter().filter(|r| interrupted.contains(&r.id)) {
            registry.persist(record).await;
        }

        if !recovered.is_empty() {
            info!(
                recovered = recovered.len(),
                interrupted = interrupted.len(),
                "Recovered job records from previous process"
            );
        }

        registry.purge_expired().await;
        registry
    }

    /// Allocates a fresh job id and registers a pending record for it.
    ///
    /// Expired terminal records are purged first.
    pub async fn create(&self) -> JobId {
        self.purge_expired().await;

        let id = JobId::new();
        let record = JobRecord::new(id, self.log_capacity);
        self.persist(&record).await;

        self.jobs
            .write()
            .await
            .insert(id, Arc::new(RwLock::new(record)));

        debug!(job_id = %id, "Created job");
        id
    }

    /// Returns a consistent copy of a job record.
    pub async fn get(&self, id: &JobId) -> Result<JobRecord, RegistryError> {
        let record = self.lookup(id).await?;
        let guard = record.read().await;
        Ok(guard.clone())
    }

    /// Returns true if the registry holds a record for `id`.
    pub async fn contains(&self, id: &JobId) -> bool {
        self.jobs.read().await.contains_key(id)
    }

    /// Returns copies of all records, oldest first.
    pub async fn list(&self) -> Vec<JobRecord> {
        let shared: Vec<SharedRecord> = self.jobs.read().await.values().cloned().collect();

        let mut records = Vec::with_capacity(shared.len());
        for record in shared {
            records.push(record.read().await.clone());
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Applies `f` to a record under its lock.
    ///
    /// If `f` succeeds the updated record is mirrored to the metadata store.
    pub async fn update<T, F>(&self, id: &JobId, f: F) -> Result<T, RegistryError>
    where
        F: FnOnce(&mut JobRecord) -> Result<T, RegistryError>,
    {
        let record = self.lookup(id).await?;
        let (value, snapshot) = {
            let mut guard = record.write().await;
            let value = f(&mut *guard)?;
            (value, guard.clone())
        };
        self.persist(&snapshot).await;
        Ok(value)
    }

    /// Moves a pending job to running with the given stage sequence.
    pub async fn start<S: AsRef<str>>(
        &self,
        id: &JobId,
        stage_names: &[S],
    ) -> Result<(), RegistryError> {
        self.update(id, |record| record.start(stage_names)).await?;
        info!(job_id = %id, stages = stage_names.len(), "Job started");
        Ok(())
    }

    pub async fn begin_stage(&self, id: &JobId, index: usize) -> Result<(), RegistryError> {
        self.update(id, |record| record.begin_stage(index)).await
    }

    pub async fn complete_stage(
        &self,
        id: &JobId,
        index: usize,
        progress: u8,
    ) -> Result<(), RegistryError> {
        self.update(id, |record| record.complete_stage(index, progress))
            .await
    }

    /// Marks a stage failed, which fails the whole job.
    pub async fn fail_stage(
        &self,
        id: &JobId,
        index: usize,
        message: &str,
        kind: FailureKind,
    ) -> Result<(), RegistryError> {
        self.update(id, |record| record.fail_stage(index, message, kind))
            .await?;
        warn!(job_id = %id, stage_index = index, failure_kind = %kind, error = %message, "Job failed");
        Ok(())
    }

    /// Completes a running job with its summary.
    pub async fn complete(
        &self,
        id: &JobId,
        summary: Map<String, Value>,
    ) -> Result<(), RegistryError> {
        self.update(id, |record| record.complete(summary)).await?;
        info!(job_id = %id, "Job completed");
        Ok(())
    }

    /// Fails a pending or running job outside of any stage.
    pub async fn fail(
        &self,
        id: &JobId,
        message: &str,
        kind: FailureKind,
    ) -> Result<(), RegistryError> {
        self.update(id, |record| record.fail(message, kind)).await?;
        warn!(job_id = %id, failure_kind = %kind, error = %message, "Job failed");
        Ok(())
    }

    /// Appends a line to a job's log and emits it through `tracing`.
    ///
    /// Log lines are not mirrored to disk individually; they are carried
    /// along with the next transition or the shutdown flush.
    pub async fn log(
        &self,
        id: &JobId,
        stage: Option<&str>,
        message: impl Into<String>,
    ) -> Result<(), RegistryError> {
        let message = message.into();
        info!(job_id = %id, stage = stage.unwrap_or("-"), "{}", message);

        let record = self.lookup(id).await?;
        record.write().await.push_log(stage, message);
        Ok(())
    }

    /// Removes terminal records whose retention window has elapsed, along
    /// with their persisted metadata.
    ///
    /// Returns the number of records removed. Non-terminal records are
    /// never purged.
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let expired = {
            let mut jobs = self.jobs.write().await;

            let mut expired = Vec::new();
            for (id, record) in jobs.iter() {
                let guard = record.read().await;
                if guard.status.is_terminal() && is_expired(&guard, now, self.retention) {
                    expired.push(*id);
                }
            }

            for id in &expired {
                jobs.remove(id);
            }
            expired
        };

        if let Some(store) = &self.metadata {
            for id in &expired {
                if let Err(e) = store.remove(&id.to_string()).await {
                    warn!(job_id = %id, error = %e, "Failed to remove expired job metadata");
                }
            }
        }

        if !expired.is_empty() {
            debug!(purged = expired.len(), "Purged expired job records");
        }
        expired.len()
    }

    /// Flushes every live record to the metadata store.
    pub async fn shutdown(&self) {
        let Some(_) = &self.metadata else {
            return;
        };

        let records = self.list().await;
        for record in &records {
            self.persist(record).await;
        }
        info!(flushed = records.len(), "Flushed job records");
    }

    /// Counts records by status.
    pub async fn status_counts(&self) -> HashMap<JobStatus, usize> {
        let mut counts = HashMap::new();
        for record in self.list().await {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        counts
    }

    async fn lookup(&self, id: &JobId) -> Result<SharedRecord, RegistryError> {
        self.jobs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    async fn persist(&self, record: &JobRecord) {
        if let Some(store) = &self.metadata {
            if let Err(e) = store.save_record(record).await {
                warn!(job_id = %record.id, error = %e, "Failed to persist job metadata");
            }
        }
    }
}

fn is_expired(record: &JobRecord, now: chrono::DateTime<Utc>, retention: Duration) -> bool {
    record
        .finished_at
        .and_then(|finished| (now - finished).to_std().ok())
        .is_some_and(|age| age > retention)
}

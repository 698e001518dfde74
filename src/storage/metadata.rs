//! Write-behind persistence of job metadata.
//!
//! One JSON file per job identifier, holding the job id, an arbitrary
//! metadata mapping and the time it was persisted. These files exist for
//! crash visibility and offline inspection only; the in-memory registry is
//! the source of truth while the process is alive.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::fs;
use tracing::warn;

use crate::error::StorageError;
use crate::scheduler::job::JobRecord;

use super::atomic::{is_temp_file, write_atomic};

/// Contents of a persisted job metadata file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedJob {
    pub job_id: String,
    pub metadata: Map<String, Value>,
    pub persisted_at: DateTime<Utc>,
}

impl PersistedJob {
    /// Interprets the metadata as a job record, if it holds one.
    pub fn record(&self) -> Option<JobRecord> {
        serde_json::from_value(Value::Object(self.metadata.clone())).ok()
    }
}

/// Local file storage for job metadata.
#[derive(Debug, Clone)]
pub struct JobMetadataStore {
    base_path: PathBuf,
}

impl JobMetadataStore {
    /// Creates a store rooted at `base_path`.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &PathBuf {
        &self.base_path
    }

    /// Returns the file path for a job.
    pub fn job_path(&self, job_id: &str) -> PathBuf {
        self.base_path.join(format!("{}.json", job_id))
    }

    async fn ensure_directory(&self) -> Result<(), StorageError> {
        if !fs::try_exists(&self.base_path).await? {
            fs::create_dir_all(&self.base_path).await?;
        }
        Ok(())
    }

    /// Persists an arbitrary metadata mapping for a job.
    pub async fn save(
        &self,
        job_id: &str,
        metadata: Map<String, Value>,
    ) -> Result<PathBuf, StorageError> {
        if job_id.is_empty() || job_id.contains(['/', '\\']) || job_id.starts_with('.') {
            return Err(StorageError::InvalidLabel(job_id.to_string()));
        }
        self.ensure_directory().await?;

        let persisted = PersistedJob {
            job_id: job_id.to_string(),
            metadata,
            persisted_at: Utc::now(),
        };

        let path = self.job_path(job_id);
        let json = serde_json::to_string_pretty(&persisted)?;
        write_atomic(&path, json.as_bytes()).await?;

        Ok(path)
    }

    /// Persists a job record as the job's metadata.
    pub async fn save_record(&self, record: &JobRecord) -> Result<PathBuf, StorageError> {
        let metadata = match serde_json::to_value(record)? {
            Value::Object(map) => map,
            other => {
                return Err(StorageError::InvalidData {
                    path: self.job_path(&record.id.to_string()).display().to_string(),
                    reason: format!("job record serialized to non-object: {}", other),
                })
            }
        };
        self.save(&record.id.to_string(), metadata).await
    }

    /// Loads the persisted metadata of a job.
    pub async fn load(&self, job_id: &str) -> Result<PersistedJob, StorageError> {
        let path = self.job_path(job_id);
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::JobNotFound(job_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let persisted: PersistedJob = serde_json::from_str(&contents)?;
        if persisted.job_id != job_id {
            return Err(StorageError::InvalidData {
                path: path.display().to_string(),
                reason: format!(
                    "job id mismatch: expected {}, got {}",
                    job_id, persisted.job_id
                ),
            });
        }

        Ok(persisted)
    }

    /// Lists the job ids with persisted metadata, sorted.
    pub async fn list(&self) -> Result<Vec<String>, StorageError> {
        if !fs::try_exists(&self.base_path).await? {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_temp_file(&path) || path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Deletes the persisted metadata of a job.
    ///
    /// Returns false if there was nothing to delete.
    pub async fn remove(&self, job_id: &str) -> Result<bool, StorageError> {
        match fs::remove_file(self.job_path(job_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Loads every persisted job record. Unreadable files are skipped with a
    /// warning.
    pub async fn load_records(&self) -> Result<Vec<JobRecord>, StorageError> {
        let mut records = Vec::new();
        for job_id in self.list().await? {
            match self.load(&job_id).await {
                Ok(persisted) => match persisted.record() {
                    Some(record) => records.push(record),
                    None => {
                        warn!(job_id = %job_id, "Persisted metadata is not a job record, skipping")
                    }
                },
                Err(e) => warn!(job_id = %job_id, error = %e, "Failed to load job metadata"),
            }
        }
        Ok(records)
    }
}

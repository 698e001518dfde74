//! Snapshot store for pipeline state at stage boundaries.
//!
//! Each snapshot captures the full pipeline state right after a stage
//! completed, addressed by `(run_label, stage_label)`:
//!
//! ```text
//! <root>/
//!   <run_label>/
//!     _run.json            manifest: stages captured, in capture order
//!     <stage_label>.json   { run_label, stage_label, captured_at, state }
//! ```
//!
//! Files are written atomically, so a concurrent reader never observes a
//! partial snapshot. Snapshots are write-once unless the store was built
//! with overwrite enabled, in which case a capture replaces the file whole.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::pipeline::state::PipelineState;

use super::atomic::{is_temp_file, write_atomic, write_atomic_new};

/// File name of the per-run manifest.
pub const MANIFEST_FILE: &str = "_run.json";

/// A captured pipeline state and the stage that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub run_label: String,
    pub stage_label: String,
    pub captured_at: DateTime<Utc>,
    pub state: PipelineState,
}

/// Manifest entry for one captured stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedStage {
    pub stage_label: String,
    pub captured_at: DateTime<Utc>,
}

/// Per-run manifest listing captured stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_label: String,
    pub stages: Vec<CapturedStage>,
    pub updated_at: DateTime<Utc>,
}

/// Validates a run or stage label for use as a path component.
pub fn validate_label(label: &str) -> Result<(), StorageError> {
    let valid = !label.is_empty()
        && !label.starts_with('.')
        && label != MANIFEST_FILE.trim_end_matches(".json")
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidLabel(label.to_string()))
    }
}

/// File-based snapshot storage.
pub struct SnapshotStore {
    base_path: PathBuf,
    overwrite: bool,
    // Serializes manifest read-modify-write cycles within this process.
    manifest_lock: Mutex<()>,
}

impl SnapshotStore {
    /// Creates a write-once snapshot store rooted at `base_path`.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            overwrite: false,
            manifest_lock: Mutex::new(()),
        }
    }

    /// Allows a capture to replace an existing snapshot.
    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn base_path(&self) -> &PathBuf {
        &self.base_path
    }

    pub fn run_dir(&self, run_label: &str) -> PathBuf {
        self.base_path.join(run_label)
    }

    /// Returns the path where a snapshot would be stored.
    pub fn snapshot_path(&self, run_label: &str, stage_label: &str) -> PathBuf {
        self.run_dir(run_label).join(format!("{}.json", stage_label))
    }

    /// Captures `state` as the snapshot for `(run_label, stage_label)`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::AlreadyExists` if the pair was captured before
    /// and overwrite is disabled. If the manifest cannot be updated for a new
    /// pair, the snapshot file is removed again and the error is returned.
    pub async fn capture(
        &self,
        run_label: &str,
        stage_label: &str,
        state: &PipelineState,
    ) -> Result<PathBuf, StorageError> {
        validate_label(run_label)?;
        validate_label(stage_label)?;

        let run_dir = self.run_dir(run_label);
        fs::create_dir_all(&run_dir).await?;

        let path = self.snapshot_path(run_label, stage_label);
        let replacing = self.overwrite && fs::try_exists(&path).await?;

        let snapshot = Snapshot {
            run_label: run_label.to_string(),
            stage_label: stage_label.to_string(),
            captured_at: Utc::now(),
            state: state.clone(),
        };
        let json = serde_json::to_string_pretty(&snapshot)?;

        if self.overwrite {
            write_atomic(&path, json.as_bytes()).await?;
        } else {
            match write_atomic_new(&path, json.as_bytes()).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    return Err(StorageError::AlreadyExists {
                        run_label: run_label.to_string(),
                        stage_label: stage_label.to_string(),
                    })
                }
                Err(e) => return Err(e.into()),
            }
        }

        if let Err(e) = self
            .record_in_manifest(run_label, stage_label, snapshot.captured_at)
            .await
        {
            if replacing {
                // The stage is already listed; only its timestamp is stale.
                warn!(
                    run_label = %run_label,
                    stage_label = %stage_label,
                    error = %e,
                    "Snapshot replaced but manifest not updated"
                );
            } else {
                // A snapshot missing from the manifest would be invisible to
                // listings, so the capture is undone.
                let _ = fs::remove_file(&path).await;
                return Err(e);
            }
        }

        debug!(
            run_label = %run_label,
            stage_label = %stage_label,
            keys = state.len(),
            "Captured snapshot"
        );

        Ok(path)
    }

    /// Loads the full snapshot record for `(run_label, stage_label)`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound`, listing available runs and the
    /// stages captured for `run_label`, if the pair does not exist.
    pub async fn load_snapshot(
        &self,
        run_label: &str,
        stage_label: &str,
    ) -> Result<Snapshot, StorageError> {
        let path = self.snapshot_path(run_label, stage_label);
        let exists = validate_label(run_label).is_ok()
            && validate_label(stage_label).is_ok()
            && fs::try_exists(&path).await?;

        if !exists {
            return Err(self.not_found(run_label, stage_label).await);
        }

        let contents = fs::read_to_string(&path).await?;
        let snapshot: Snapshot =
            serde_json::from_str(&contents).map_err(|e| StorageError::InvalidData {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        if snapshot.run_label != run_label || snapshot.stage_label != stage_label {
            return Err(StorageError::InvalidData {
                path: path.display().to_string(),
                reason: format!(
                    "label mismatch: expected {}/{}, got {}/{}",
                    run_label, stage_label, snapshot.run_label, snapshot.stage_label
                ),
            });
        }

        Ok(snapshot)
    }

    /// Loads the state captured for `(run_label, stage_label)`.
    pub async fn load(
        &self,
        run_label: &str,
        stage_label: &str,
    ) -> Result<PipelineState, StorageError> {
        Ok(self.load_snapshot(run_label, stage_label).await?.state)
    }

    /// Returns true if the pair has been captured.
    pub async fn exists(&self, run_label: &str, stage_label: &str) -> bool {
        if validate_label(run_label).is_err() || validate_label(stage_label).is_err() {
            return false;
        }
        fs::try_exists(self.snapshot_path(run_label, stage_label))
            .await
            .unwrap_or(false)
    }

    /// Lists run labels, sorted.
    pub async fn list_runs(&self) -> Result<Vec<String>, StorageError> {
        if !fs::try_exists(&self.base_path).await? {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = fs::read_dir(&self.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if validate_label(name).is_ok() {
                    runs.push(name.to_string());
                }
            }
        }
        runs.sort();
        Ok(runs)
    }

    /// Lists the stages captured for a run, in capture order.
    ///
    /// Uses the manifest when present and falls back to scanning the run
    /// directory (sorted by name) otherwise.
    pub async fn list_stages(&self, run_label: &str) -> Result<Vec<String>, StorageError> {
        validate_label(run_label)?;

        if let Some(manifest) = self.load_manifest(run_label).await? {
            return Ok(manifest
                .stages
                .into_iter()
                .map(|s| s.stage_label)
                .collect());
        }

        let run_dir = self.run_dir(run_label);
        if !fs::try_exists(&run_dir).await? {
            return Ok(Vec::new());
        }

        let mut stages = Vec::new();
        let mut entries = fs::read_dir(&run_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_snapshot_file(&path) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    stages.push(stem.to_string());
                }
            }
        }
        stages.sort();
        Ok(stages)
    }

    /// Loads the manifest of a run, if one was written.
    pub async fn load_manifest(&self, run_label: &str) -> Result<Option<RunManifest>, StorageError> {
        let path = self.run_dir(run_label).join(MANIFEST_FILE);
        match fs::read_to_string(&path).await {
            Ok(contents) => {
                let manifest =
                    serde_json::from_str(&contents).map_err(|e| StorageError::InvalidData {
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    })?;
                Ok(Some(manifest))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn record_in_manifest(
        &self,
        run_label: &str,
        stage_label: &str,
        captured_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let _guard = self.manifest_lock.lock().await;

        let mut manifest = self
            .load_manifest(run_label)
            .await?
            .unwrap_or_else(|| RunManifest {
                run_label: run_label.to_string(),
                stages: Vec::new(),
                updated_at: captured_at,
            });

        manifest.stages.retain(|s| s.stage_label != stage_label);
        manifest.stages.push(CapturedStage {
            stage_label: stage_label.to_string(),
            captured_at,
        });
        manifest.updated_at = Utc::now();

        let path = self.run_dir(run_label).join(MANIFEST_FILE);
        let json = serde_json::to_string_pretty(&manifest)?;
        write_atomic(&path, json.as_bytes()).await?;
        Ok(())
    }

    async fn not_found(&self, run_label: &str, stage_label: &str) -> StorageError {
        let available_runs = self.list_runs().await.unwrap_or_default();
        let available_stages = if available_runs.iter().any(|r| r == run_label) {
            self.list_stages(run_label).await.unwrap_or_default()
        } else {
            Vec::new()
        };
        StorageError::NotFound {
            run_label: run_label.to_string(),
            stage_label: stage_label.to_string(),
            available_runs,
            available_stages,
        }
    }
}

fn is_snapshot_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("json")
        && !is_temp_file(path)
        && path.file_name().and_then(|n| n.to_str()) != Some(MANIFEST_FILE)
}

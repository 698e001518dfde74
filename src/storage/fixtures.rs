//! Fixture loading for isolated stage tests.
//!
//! A fixture is a pipeline state used to seed one stage without running its
//! predecessors. It comes either from a captured snapshot or from a
//! hand-authored template file `<template_root>/<name>.json`, which may hold
//! a serialized [`PipelineState`] or a bare JSON object.

use std::path::PathBuf;

use serde_json::Value;
use tokio::fs;
use tracing::debug;

use crate::error::{StageError, StorageError};
use crate::pipeline::config::PipelineConfig;
use crate::pipeline::stage::Stage;
use crate::pipeline::state::PipelineState;

use super::atomic::is_temp_file;
use super::snapshots::{validate_label, SnapshotStore};

/// Snapshot root used when none is configured.
pub const DEFAULT_SNAPSHOT_ROOT: &str = "./snapshots";

/// Loads snapshots and templates and replays single stages on them.
pub struct FixtureLoader {
    snapshots: SnapshotStore,
    template_root: PathBuf,
}

impl FixtureLoader {
    pub fn new(snapshot_root: impl Into<PathBuf>, template_root: impl Into<PathBuf>) -> Self {
        Self {
            snapshots: SnapshotStore::new(snapshot_root),
            template_root: template_root.into(),
        }
    }

    /// Uses the configured snapshot and template directories.
    ///
    /// Falls back to `./snapshots` when no snapshot directory is configured.
    pub fn from_config(config: &PipelineConfig) -> Self {
        let snapshot_root = config
            .snapshot_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SNAPSHOT_ROOT));
        Self::new(snapshot_root, config.template_dir.clone())
    }

    pub fn snapshot_store(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn template_root(&self) -> &PathBuf {
        &self.template_root
    }

    /// Loads the state captured after `stage_label` in `run_label`.
    pub async fn load_snapshot(
        &self,
        run_label: &str,
        stage_label: &str,
    ) -> Result<PipelineState, StorageError> {
        self.snapshots.load(run_label, stage_label).await
    }

    /// Loads the template `name`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::TemplateNotFound`, listing the available
    /// templates, if no such template exists.
    pub async fn load_template(&self, name: &str) -> Result<PipelineState, StorageError> {
        let path = self.template_root.join(format!("{}.json", name));

        let contents = if validate_label(name).is_ok() {
            match fs::read_to_string(&path).await {
                Ok(contents) => Some(contents),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(e.into()),
            }
        } else {
            None
        };

        let Some(contents) = contents else {
            return Err(StorageError::TemplateNotFound {
                name: name.to_string(),
                available: self.list_templates().await.unwrap_or_default(),
            });
        };

        let value: Value =
            serde_json::from_str(&contents).map_err(|e| StorageError::InvalidData {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        PipelineState::from_json_value(value).ok_or_else(|| StorageError::InvalidData {
            path: path.display().to_string(),
            reason: "template must be a JSON object".to_string(),
        })
    }

    /// Lists template names, sorted.
    pub async fn list_templates(&self) -> Result<Vec<String>, StorageError> {
        if !fs::try_exists(&self.template_root).await? {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.template_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_temp_file(&path) || path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Runs `stage` alone on the snapshot captured after `predecessor` in
    /// `run_label`.
    ///
    /// The stage output is merged into the snapshot exactly as a full run
    /// would merge it, and the stage's output contract is checked.
    pub async fn replay(
        &self,
        stage: &dyn Stage,
        run_label: &str,
        predecessor: &str,
    ) -> Result<PipelineState, ReplayError> {
        let state = self.load_snapshot(run_label, predecessor).await?;
        debug!(
            run_label = %run_label,
            predecessor = %predecessor,
            stage = %stage.name(),
            "Replaying stage from snapshot"
        );
        Ok(run_isolated(stage, state).await?)
    }

    /// Runs `stage` alone on the template `name`.
    pub async fn replay_template(
        &self,
        stage: &dyn Stage,
        name: &str,
    ) -> Result<PipelineState, ReplayError> {
        let state = self.load_template(name).await?;
        Ok(run_isolated(stage, state).await?)
    }
}

/// Errors from replaying a stage on a fixture.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("Fixture error: {0}")]
    Fixture(#[from] StorageError),

    #[error("Stage error: {0}")]
    Stage(#[from] StageError),
}

async fn run_isolated(stage: &dyn Stage, state: PipelineState) -> Result<PipelineState, StageError> {
    let output = stage.execute(state.clone()).await?;
    let merged = state.merged(output);
    stage.contract().check_outputs(&merged)?;
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stages::SimulatedStage;
    use tempfile::TempDir;

    fn loader(temp_dir: &TempDir) -> FixtureLoader {
        FixtureLoader::new(
            temp_dir.path().join("snapshots"),
            temp_dir.path().join("templates"),
        )
    }

    async fn write_template(temp_dir: &TempDir, name: &str, contents: &str) {
        let dir = temp_dir.path().join("templates");
        fs::create_dir_all(&dir).await.expect("create templates dir");
        fs::write(dir.join(format!("{}.json", name)), contents)
            .await
            .expect("write template");
    }

    #[test]
    fn test_from_config() {
        let config = PipelineConfig::new()
            .with_snapshot_dir("/data/snaps")
            .with_template_dir("/data/templates");
        let loader = FixtureLoader::from_config(&config);
        assert_eq!(loader.snapshot_store().base_path(), &PathBuf::from("/data/snaps"));
        assert_eq!(loader.template_root(), &PathBuf::from("/data/templates"));

        let loader = FixtureLoader::from_config(&PipelineConfig::new());
        assert_eq!(
            loader.snapshot_store().base_path(),
            &PathBuf::from(DEFAULT_SNAPSHOT_ROOT)
        );
    }

    #[tokio::test]
    async fn test_load_bare_object_template() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        write_template(
            &temp_dir,
            "retail",
            r#"{"company_name": "Acme", "research_summary": "sells anvils"}"#,
        )
        .await;

        let state = loader(&temp_dir)
            .load_template("retail")
            .await
            .expect("template");
        assert_eq!(state.get_str("company_name"), Some("Acme"));
        assert_eq!(state.len(), 2);
    }

    #[tokio::test]
    async fn test_load_serialized_state_template() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let state = PipelineState::new().with("schema", serde_json::json!({"tables": []}));
        let json = serde_json::to_string(&state).expect("serialize");
        write_template(&temp_dir, "modeled", &json).await;

        let loaded = loader(&temp_dir)
            .load_template("modeled")
            .await
            .expect("template");
        assert!(loaded.contains_key("schema"));
        assert!(!loaded.contains_key("values"));
    }

    #[tokio::test]
    async fn test_missing_template_lists_available() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        write_template(&temp_dir, "b", "{}").await;
        write_template(&temp_dir, "a", "{}").await;

        match loader(&temp_dir).load_template("c").await {
            Err(StorageError::TemplateNotFound { name, available }) => {
                assert_eq!(name, "c");
                assert_eq!(available, vec!["a", "b"]);
            }
            other => panic!("expected TemplateNotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_object_template_is_invalid() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        write_template(&temp_dir, "list", "[1, 2]").await;
        assert!(matches!(
            loader(&temp_dir).load_template("list").await,
            Err(StorageError::InvalidData { .. })
        ));
    }

    #[tokio::test]
    async fn test_replay_from_snapshot() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let loader = loader(&temp_dir);

        let after_research = PipelineState::new()
            .with("customer_url", "https://example.com")
            .with("company_name", "example")
            .with("research_summary", "an example company");
        loader
            .snapshot_store()
            .capture("run-1", "research", &after_research)
            .await
            .expect("capture");

        let narrative = SimulatedStage::named("narrative");
        let replayed = loader
            .replay(&narrative, "run-1", "research")
            .await
            .expect("replay");
        assert!(replayed.contains_key("customer_url"));
        assert!(replayed.contains_key("demo_title"));
        assert!(replayed.contains_key("golden_queries"));
    }

    #[tokio::test]
    async fn test_replay_missing_snapshot() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let stage = SimulatedStage::named("narrative");
        assert!(matches!(
            loader(&temp_dir).replay(&stage, "run-1", "research").await,
            Err(ReplayError::Fixture(StorageError::NotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn test_replay_template_surfaces_stage_errors() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        write_template(&temp_dir, "empty", "{}").await;

        let stage = SimulatedStage::named("provisioning");
        assert!(matches!(
            loader(&temp_dir).replay_template(&stage, "empty").await,
            Err(ReplayError::Stage(StageError::InvalidInput { .. }))
        ));
    }
}

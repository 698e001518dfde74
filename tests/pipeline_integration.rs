//! End-to-end tests of the run-creation and status surfaces.
//!
//! Every test drives jobs through `DemoService`, so runs execute on the
//! background runner exactly as they would behind a transport layer.

use std::sync::Arc;
use std::time::Duration;

use demo_forge::error::{FailureKind, StorageError};
use demo_forge::pipeline::{
    simulated_pipeline, PipelineConfig, SimulatedStage, Stage, StageContract,
    DEFAULT_STAGE_SEQUENCE,
};
use demo_forge::scheduler::{JobId, JobRegistry, JobStatus, StageState};
use demo_forge::service::{DemoService, JobStatusView, RunRequest, ServiceError};
use demo_forge::storage::{FixtureLoader, SnapshotStore};
use tempfile::TempDir;

fn three_stage_pipeline(fail_second: bool) -> Vec<Arc<dyn Stage>> {
    let second = SimulatedStage::new(
        StageContract::new("modeling")
            .requires(&["research_summary"])
            .produces(&["schema"]),
    );
    let second = if fail_second {
        second.failing_with("invalid schema")
    } else {
        second
    };

    vec![
        Arc::new(SimulatedStage::new(
            StageContract::new("research")
                .requires(&["customer_url"])
                .produces(&["company_name", "research_summary"]),
        )),
        Arc::new(second),
        Arc::new(SimulatedStage::new(
            StageContract::new("provisioning")
                .requires(&["schema"])
                .produces(&["dataset_id", "table_names"]),
        )),
    ]
}

async fn wait_for_terminal(service: &DemoService, job_id: &JobId) -> JobStatusView {
    for _ in 0..500 {
        let view = service.status(job_id, 50).await.expect("job exists");
        if view.is_terminal() {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} never reached a terminal status", job_id);
}

#[tokio::test]
async fn test_failing_stage_freezes_progress() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config = PipelineConfig::new().with_snapshot_dir(temp_dir.path());
    let service = DemoService::bootstrap(config, three_stage_pipeline(true)).await;

    let job_id = service
        .create_run(RunRequest::new("https://example.com"))
        .await
        .expect("create run");
    let view = wait_for_terminal(&service, &job_id).await;

    assert_eq!(view.status, JobStatus::Failed);
    let states: Vec<StageState> = view.stages.iter().map(|s| s.state).collect();
    assert_eq!(
        states,
        vec![
            StageState::Completed,
            StageState::Failed,
            StageState::NotStarted
        ]
    );
    assert_eq!(view.progress, 33);
    assert_eq!(view.stages[1].error.as_deref(), Some("invalid schema"));
    assert!(view
        .error
        .as_deref()
        .is_some_and(|e| e.contains("modeling") && e.contains("invalid schema")));
    assert!(view.result.is_empty());

    // Only the stage that succeeded left a snapshot behind.
    let store = SnapshotStore::new(temp_dir.path());
    let stages = store
        .list_stages(&job_id.to_string())
        .await
        .expect("list stages");
    assert_eq!(stages, vec!["research"]);
}

#[tokio::test]
async fn test_successful_run_completes_with_snapshots() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config = PipelineConfig::new().with_snapshot_dir(temp_dir.path());
    let service = DemoService::bootstrap(config, three_stage_pipeline(false)).await;

    let job_id = service
        .create_run(RunRequest::new("https://example.com"))
        .await
        .expect("create run");
    let view = wait_for_terminal(&service, &job_id).await;

    assert_eq!(view.status, JobStatus::Completed);
    assert_eq!(view.progress, 100);
    assert!(view
        .stages
        .iter()
        .all(|s| s.state == StageState::Completed));
    assert_eq!(
        view.result.get("dataset_id"),
        Some(&serde_json::Value::from("example_demo"))
    );
    assert!(view.result.contains_key("table_names"));

    let store = SnapshotStore::new(temp_dir.path());
    assert_eq!(
        store
            .list_stages(&job_id.to_string())
            .await
            .expect("list stages")
            .len(),
        3
    );
}

#[tokio::test]
async fn test_progress_is_monotonic_and_reaches_100_only_on_completion() {
    let service = DemoService::bootstrap(
        PipelineConfig::new(),
        simulated_pipeline(Duration::from_millis(15)),
    )
    .await;

    let job_id = service
        .create_run(RunRequest::new("https://example.com"))
        .await
        .expect("create run");

    let mut observed = Vec::new();
    loop {
        let view = service.status(&job_id, 0).await.expect("status");
        assert!(view.logs.is_empty());
        if view.progress == 100 {
            assert_eq!(view.status, JobStatus::Completed);
        }
        observed.push(view.progress);
        if view.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(3)).await;
    }

    assert!(observed.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(observed.last(), Some(&100));
}

#[tokio::test]
async fn test_snapshot_replay_matches_full_run() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config = PipelineConfig::new().with_snapshot_dir(temp_dir.path());
    let service = DemoService::bootstrap(config, simulated_pipeline(Duration::ZERO)).await;

    let job_id = service
        .create_run(RunRequest::new("https://shop.example.com").with_context("industry_hint", "retail"))
        .await
        .expect("create run");
    assert_eq!(
        wait_for_terminal(&service, &job_id).await.status,
        JobStatus::Completed
    );

    let run_label = job_id.to_string();
    let loader = FixtureLoader::new(temp_dir.path(), temp_dir.path().join("templates"));

    for pair in DEFAULT_STAGE_SEQUENCE.windows(2) {
        let (predecessor, stage_name) = (pair[0], pair[1]);
        let stage = SimulatedStage::named(stage_name);

        let replayed = loader
            .replay(&stage, &run_label, predecessor)
            .await
            .expect("replay");
        let captured = loader
            .load_snapshot(&run_label, stage_name)
            .await
            .expect("captured snapshot");

        assert_eq!(
            replayed, captured,
            "replaying '{}' from '{}' diverged from the full run",
            stage_name, predecessor
        );
    }
}

#[tokio::test]
async fn test_missing_snapshot_is_not_found() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config = PipelineConfig::new().with_snapshot_dir(temp_dir.path());
    let service = DemoService::bootstrap(config, three_stage_pipeline(false)).await;

    let job_id = service
        .create_run(RunRequest::new("https://example.com"))
        .await
        .expect("create run");
    wait_for_terminal(&service, &job_id).await;

    let store = SnapshotStore::new(temp_dir.path());
    match store.load(&job_id.to_string(), "validation").await {
        Err(StorageError::NotFound {
            available_runs,
            available_stages,
            ..
        }) => {
            assert_eq!(available_runs, vec![job_id.to_string()]);
            assert_eq!(available_stages, vec!["research", "modeling", "provisioning"]);
        }
        other => panic!("expected NotFound, got {:?}", other),
    }
}

#[tokio::test]
async fn test_concurrent_runs_do_not_interfere() {
    let mut stages = three_stage_pipeline(false);
    stages.insert(
        0,
        Arc::new(
            SimulatedStage::new(StageContract::new("warmup").produces(&["warm"]))
                .with_delay(Duration::from_millis(20)),
        ),
    );
    let service = Arc::new(DemoService::bootstrap(PipelineConfig::new(), stages).await);

    let mut handles = Vec::new();
    for i in 0..8 {
        let service = Arc::clone(&service);
        handles.push(tokio::spawn(async move {
            let url = format!("https://customer{}.example.com", i);
            service
                .create_run(RunRequest::new(url))
                .await
                .expect("create run")
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.expect("join"));
    }
    let mut unique = ids.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), ids.len());

    for job_id in &ids {
        let view = wait_for_terminal(&service, job_id).await;
        assert_eq!(view.job_id, *job_id);
        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(view.stages.len(), 4);
    }
}

#[tokio::test]
async fn test_unknown_job_is_distinguishable() {
    let service =
        DemoService::bootstrap(PipelineConfig::new(), simulated_pipeline(Duration::ZERO)).await;
    assert!(matches!(
        service.status(&JobId::new(), 10).await,
        Err(ServiceError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_stage_timeout_fails_job() {
    let stages: Vec<Arc<dyn Stage>> = vec![Arc::new(
        SimulatedStage::new(StageContract::new("research").produces(&["company_name"]))
            .with_delay(Duration::from_secs(10))
            .with_timeout(Duration::from_millis(30)),
    )];
    let service = DemoService::bootstrap(PipelineConfig::new(), stages).await;

    let job_id = service
        .create_run(RunRequest::new("https://example.com"))
        .await
        .expect("create run");
    let view = wait_for_terminal(&service, &job_id).await;

    assert_eq!(view.status, JobStatus::Failed);
    assert_eq!(view.failure_kind, Some(FailureKind::Timeout));
    assert_eq!(view.progress, 0);
}

#[tokio::test]
async fn test_shutdown_fails_in_flight_jobs() {
    let stages: Vec<Arc<dyn Stage>> = vec![Arc::new(
        SimulatedStage::new(StageContract::new("research").produces(&["company_name"]))
            .with_delay(Duration::from_secs(30)),
    )];
    let service = DemoService::bootstrap(PipelineConfig::new(), stages).await;

    let job_id = service
        .create_run(RunRequest::new("https://example.com"))
        .await
        .expect("create run");
    tokio::time::sleep(Duration::from_millis(20)).await;

    let report = service.shutdown(Duration::from_millis(20)).await;
    assert_eq!(report.aborted, vec![job_id]);

    let view = service.status(&job_id, 10).await.expect("status");
    assert_eq!(view.status, JobStatus::Failed);
    assert_eq!(view.failure_kind, Some(FailureKind::Infrastructure));

    // New work is refused once shut down.
    assert!(matches!(
        service.create_run(RunRequest::new("https://example.com")).await,
        Err(ServiceError::Runner(_))
    ));
}

#[tokio::test]
async fn test_restart_reports_interrupted_jobs() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config = PipelineConfig::new().with_metadata_dir(temp_dir.path());

    // A previous process that stopped mid-run.
    let job_id = {
        let registry = JobRegistry::new(&config);
        let job_id = registry.create().await;
        registry
            .start(&job_id, &DEFAULT_STAGE_SEQUENCE)
            .await
            .expect("start");
        registry.begin_stage(&job_id, 0).await.expect("begin");
        job_id
    };

    let service = DemoService::bootstrap(config, simulated_pipeline(Duration::ZERO)).await;
    let view = service.status(&job_id, 10).await.expect("recovered job");

    assert_eq!(view.status, JobStatus::Failed);
    assert!(view.recovered);
    assert!(view
        .error
        .as_deref()
        .is_some_and(|e| e.contains("outcome unknown")));
}

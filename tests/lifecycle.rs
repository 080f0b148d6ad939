//! End-to-end lifecycle through the public library API, with `sh` standing in
//! for the load tool.

use std::time::Duration;

use antload::config::AppConfig;
use antload::context::AppContext;
use antload::load::aggregate::{MetricsOutput, ResultOutput};
use antload::load::{ExecutionRequest, Phase};
use antload::orchestrator::{OrchestratorError, StopOutcome};
use tokio_test::{assert_err, assert_ok};

fn context(dir: &tempfile::TempDir, script: &str) -> AppContext {
    let mut config = AppConfig::default();
    config.datasource.path = dir.path().join("meta/ant_meta.db").to_string_lossy().into_owned();
    config.load.program = "sh".to_string();
    config.load.args = vec!["-c".to_string(), script.to_string()];
    config.load.work_dir = dir.path().to_string_lossy().into_owned();
    config.load.result_dir = dir.path().join("result").to_string_lossy().into_owned();
    config.load.stop_grace_secs = 1;
    AppContext::init(config).unwrap()
}

fn request(key: &str) -> ExecutionRequest {
    serde_json::from_value(serde_json::json!({
        "loadTestKey": key,
        "target": { "hostname": "10.0.0.20", "port": 8080 },
        "profile": { "virtualUsers": 4, "durationSecs": 10 }
    }))
    .unwrap()
}

async fn wait_for(ctx: &AppContext, key: &str, phase: Phase) {
    for _ in 0..200 {
        if ctx.orchestrator.get_state(key).unwrap().phase == phase {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("{} never reached {}", key, phase);
}

#[tokio::test]
async fn test_completed_run_aggregates_results_and_metrics() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(
        &dir,
        "printf 'timeStamp,elapsed,label,responseCode,success,bytes,sentBytes\\n\
         1000,40,home,200,true,2048,512\\n\
         1500,60,home,500,false,1024,512\\n' > {result_file} && \
         printf 'timeStamp,elapsed,label,responseCode,success\\n\
         1000,12500,10.0.0.20 CPU,200,true\\n\
         2000,37500,10.0.0.20 CPU,200,true\\n' > {metrics_file}",
    );

    let key = assert_ok!(ctx.orchestrator.start_test(request("run-1")).await);
    assert_eq!(key, "run-1");
    wait_for(&ctx, "run-1", Phase::Completed).await;

    let state = ctx.orchestrator.get_state("run-1").unwrap();
    assert!(state.started_at.is_some());
    assert!(state.finished_at.is_some());
    assert_eq!(state.failure_reason, None);

    match assert_ok!(ctx.orchestrator.result("run-1", Some("aggregate")).await) {
        ResultOutput::Aggregate(stats) => {
            assert_eq!(stats.len(), 1);
            assert_eq!(stats[0].label, "home");
            assert_eq!(stats[0].request_count, 2);
            assert_eq!(stats[0].min_time, 40);
            assert_eq!(stats[0].max_time, 60);
            assert_eq!(stats[0].error_percent, 50.0);
        }
        other => panic!("unexpected output {:?}", other),
    }

    match assert_ok!(ctx.orchestrator.metrics("run-1", Some("aggregate")).await) {
        MetricsOutput::Aggregate(stats) => {
            assert_eq!(stats[0].unit, "%");
            assert_eq!(stats[0].count, 2);
            assert_eq!(stats[0].min, 12.5);
            assert_eq!(stats[0].max, 37.5);
        }
        other => panic!("unexpected output {:?}", other),
    }

    // A finished key cannot be started again.
    let err = assert_err!(ctx.orchestrator.start_test(request("run-1")).await);
    assert!(matches!(err, OrchestratorError::Conflict { .. }));
}

#[tokio::test]
async fn test_stop_and_restart_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(&dir, "sleep 30");

    assert_ok!(ctx.orchestrator.start_test(request("long")).await);
    assert_eq!(ctx.orchestrator.get_state("long").unwrap().phase, Phase::Running);
    assert_eq!(
        assert_ok!(ctx.orchestrator.stop_test("long").await),
        StopOutcome::Stopped
    );
    assert_eq!(
        assert_ok!(ctx.orchestrator.stop_test("long").await),
        StopOutcome::NotRunning {
            phase: Phase::Stopped
        }
    );

    // A second process over the same database sees RUNNING rows it does not own.
    assert_ok!(ctx.orchestrator.start_test(request("orphan")).await);
    let other = context(&dir, "sleep 30");
    assert_eq!(assert_ok!(other.orchestrator.recover().await), 1);
    let state = other.orchestrator.get_state("orphan").unwrap();
    assert_eq!(state.phase, Phase::Failed);
    assert_eq!(
        state.failure_reason.as_deref(),
        Some("orchestrator restarted during run")
    );

    ctx.orchestrator.stop_all().await;
}

#[tokio::test]
async fn test_unknown_key_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(&dir, "exit 0");

    let err = assert_err!(ctx.orchestrator.get_state("missing"));
    assert!(matches!(err, OrchestratorError::NotFound(_)));
    let err = assert_err!(ctx.orchestrator.result("missing", None).await);
    assert!(matches!(err, OrchestratorError::NotFound(_)));
    assert!(ctx.orchestrator.list_agents().unwrap().is_empty());
}

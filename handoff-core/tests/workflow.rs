mod support;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::join_all;
use serde_json::json;

use handoff_core::WorkflowErrorKind;
use handoff_core::model::{FlagStatus, FlagType, SessionId, WorkerId};
use handoff_core::orchestration::{
    HandoffConfig, HandoffRuntime, HandoffRuntimeBuilder, PersistedEntity,
    PersistenceCollaborator, SubmitRequest, WorkflowStatus, slots,
};

use support::{Fixture, ScriptedInference, ScriptedSynthesis};

fn fast_config() -> HandoffConfig {
    let mut config = HandoffConfig::default();
    config.workers.poll_interval_ms = 20;
    config.coordinator.recheck_interval_ms = 20;
    config.sweeper.interval_ms = 50;
    config
}

fn runtime(
    config: HandoffConfig,
    inference: Arc<ScriptedInference>,
    synthesis: Arc<ScriptedSynthesis>,
) -> Result<HandoffRuntime> {
    Ok(HandoffRuntimeBuilder::new(config)
        .with_inference(inference)
        .with_synthesis(synthesis)
        .build()?)
}

async fn finished(runtime: &HandoffRuntime, session: &SessionId) -> Result<WorkflowStatus> {
    let status = tokio::time::timeout(Duration::from_secs(10), runtime.await_status(session))
        .await
        .context("workflow did not finish in time")??;
    Ok(status)
}

#[tokio::test]
async fn predict_then_report_chain_resolves_to_done() -> Result<()> {
    let fixture = Fixture::new();
    let session = fixture
        .coordinator
        .submit(SubmitRequest::new(json!({ "scan": "mri-1" })).with_session("S1"))
        .await?;

    let predict = fixture.wait_for_pending(FlagType::Predict).await?;
    assert!(fixture.store.claim(predict, &WorkerId::from("prediction-0")).await);
    assert!(fixture.store.complete(predict, json!({ "label": "positive" })).await);

    let report = fixture.wait_for_pending(FlagType::GenerateReport).await?;
    let report_flag = fixture.store.get(report).await.context("report flag")?;
    assert_eq!(report_flag.session_id, session);
    assert!(fixture.store.claim(report, &WorkerId::from("report-0")).await);
    assert!(fixture.store.complete(report, json!({ "path": "/tmp/r.pdf" })).await);

    let status = fixture.coordinator.await_status(&session).await?;
    let result = status.result().context("workflow should be done")?;
    assert_eq!(result.report_path.as_deref(), Some("/tmp/r.pdf"));
    assert_eq!(result.prediction, Some(json!({ "label": "positive" })));

    let record_id = result.record_id.clone().context("report persisted")?;
    match fixture.persistence.load(record_id).await? {
        Some(PersistedEntity::Report(record)) => {
            assert_eq!(record.session_id, session);
            assert_eq!(record.report_path, "/tmp/r.pdf");
        }
        other => panic!("unexpected persisted entity {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn failed_prediction_surfaces_error_and_stops_chain() -> Result<()> {
    let fixture = Fixture::new();
    let session = fixture
        .coordinator
        .submit(SubmitRequest::new(json!({ "scan": "mri-1" })).with_session("S1"))
        .await?;

    let predict = fixture.wait_for_pending(FlagType::Predict).await?;
    assert!(fixture.store.claim(predict, &WorkerId::from("prediction-0")).await);
    assert!(fixture.store.fail(predict, "model unavailable").await);

    match fixture.coordinator.await_status(&session).await? {
        WorkflowStatus::Error { kind, message } => {
            assert_eq!(kind, WorkflowErrorKind::CollaboratorFailure);
            assert!(message.contains("model unavailable"), "message: {message}");
        }
        other => panic!("expected error, got {other:?}"),
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    let flags = fixture.store.flags_for_session(&session).await;
    assert_eq!(flags.len(), 1);
    assert!(flags.iter().all(|flag| flag.flag_type != FlagType::GenerateReport));
    Ok(())
}

#[tokio::test]
async fn expired_step_reports_timeout_not_success() -> Result<()> {
    let fixture = Fixture::new();
    let session = fixture
        .coordinator
        .submit(SubmitRequest::new(json!({})).with_session("S1"))
        .await?;

    let predict = fixture.wait_for_pending(FlagType::Predict).await?;
    assert!(fixture.store.claim(predict, &WorkerId::from("prediction-0")).await);
    assert!(fixture.store.expire(predict).await);
    assert!(!fixture.store.complete(predict, json!({ "label": "late" })).await);

    match fixture.coordinator.await_status(&session).await? {
        WorkflowStatus::Error { kind, .. } => assert_eq!(kind, WorkflowErrorKind::Timeout),
        other => panic!("expected timeout, got {other:?}"),
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runtime_drives_concurrent_workflows_end_to_end() -> Result<()> {
    let inference = Arc::new(ScriptedInference::ok(json!({ "label": "negative" })));
    let synthesis = Arc::new(ScriptedSynthesis::new("/reports"));
    let runtime = runtime(fast_config(), inference.clone(), synthesis.clone())?;
    runtime.start().await?;

    let mut sessions = Vec::new();
    for n in 0..8 {
        let request = SubmitRequest::new(json!({ "scan": format!("mri-{n}") }))
            .with_session(format!("S{n}"));
        sessions.push(runtime.submit(request).await?);
    }

    let statuses = join_all(sessions.iter().map(|session| finished(&runtime, session))).await;
    for (session, status) in sessions.iter().zip(statuses) {
        let status = status?;
        let result = status.result().context("workflow should be done")?;
        assert_eq!(
            result.report_path.as_deref(),
            Some(format!("/reports/{session}.pdf").as_str())
        );
        assert_eq!(
            runtime.sessions().get(session, slots::REPORT_PATH).await,
            Some(json!(format!("/reports/{session}.pdf")))
        );
    }

    assert_eq!(inference.calls(), sessions.len());
    assert_eq!(synthesis.calls(), sessions.len());
    let snapshot = runtime.store().snapshot().await;
    assert_eq!(snapshot.count(FlagStatus::Completed), sessions.len() * 2);

    runtime.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn collaborator_failure_reaches_the_caller() -> Result<()> {
    let inference = Arc::new(ScriptedInference::failing("model unavailable"));
    let synthesis = Arc::new(ScriptedSynthesis::new("/reports"));
    let runtime = runtime(fast_config(), inference.clone(), synthesis.clone())?;
    runtime.start().await?;

    let session = runtime
        .submit(SubmitRequest::new(json!({ "scan": "mri-1" })))
        .await?;
    match finished(&runtime, &session).await? {
        WorkflowStatus::Error { kind, message } => {
            assert_eq!(kind, WorkflowErrorKind::CollaboratorFailure);
            assert!(message.contains("model unavailable"));
        }
        other => panic!("expected error, got {other:?}"),
    }
    assert_eq!(inference.calls(), 1);
    assert_eq!(synthesis.calls(), 0);

    runtime.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn poll_loop_recovers_dropped_events() -> Result<()> {
    let mut config = fast_config();
    config.bus.subscriber_capacity = 1;
    config.workers.prediction_parallelism = 1;
    config.workers.report_parallelism = 1;

    let inference = Arc::new(
        ScriptedInference::ok(json!({ "label": "positive" })).with_delay(Duration::from_millis(5)),
    );
    let synthesis = Arc::new(ScriptedSynthesis::new("/reports"));
    let runtime = runtime(config, inference.clone(), synthesis)?;
    runtime.start().await?;

    let mut sessions = Vec::new();
    for _ in 0..12 {
        sessions.push(runtime.submit(SubmitRequest::new(json!({}))).await?);
    }
    for session in &sessions {
        assert!(finished(&runtime, session).await?.result().is_some());
    }
    assert_eq!(inference.calls(), sessions.len());

    runtime.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn workflow_deadline_leaves_slow_flag_to_the_sweeper() -> Result<()> {
    let mut config = fast_config();
    config.coordinator.workflow_timeout_secs = 1;
    let inference = Arc::new(
        ScriptedInference::ok(json!({ "label": "late" })).with_delay(Duration::from_secs(3)),
    );
    let synthesis = Arc::new(ScriptedSynthesis::new("/reports"));
    let runtime = runtime(config, inference, synthesis)?;
    runtime.start().await?;

    let session = runtime.submit(SubmitRequest::new(json!({}))).await?;
    match finished(&runtime, &session).await? {
        WorkflowStatus::Error { kind, message } => {
            assert_eq!(kind, WorkflowErrorKind::Timeout);
            assert!(message.contains("timed out"));
        }
        other => panic!("expected timeout, got {other:?}"),
    }

    let flags = runtime.store().flags_for_session(&session).await;
    assert_eq!(flags.len(), 1);
    assert_eq!(flags[0].status, FlagStatus::InProgress);

    runtime.shutdown().await?;
    Ok(())
}

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::core::config::AnalysisConfig;
use crate::core::orchestrator::{DrainOutcome, DrainSummary, JobPhase, Orchestrator};
use crate::core::pipeline::mock::MockAi;
use crate::core::pipeline::{AnalysisMode, StepKey};
use crate::core::store::types::{
    AnalysisStatus, CompanyRecord, EventCategory, EventFilter, QueuePayload,
};
use crate::core::store::{ANALYSIS_LOCK_KEY, RunnerLock, Store, test_store};

const INN: &str = "7707083893";

fn config_for(mock: &MockAi) -> AnalysisConfig {
    AnalysisConfig {
        integration_base_url: Some(mock.base.clone()),
        step_attempts: 5,
        health_retry_delay_ms: 1,
        retry_delay_ms: 1,
        step_timeout_ms: 5_000,
        health_timeout_ms: 5_000,
        job_timeout_ms: 20_000,
        ..Default::default()
    }
}

async fn orchestrator(store: &Store, config: AnalysisConfig) -> Orchestrator {
    Orchestrator::new(store.clone(), Arc::new(config)).unwrap()
}

async fn drain(o: &Orchestrator) -> DrainSummary {
    match o.drain(&CancellationToken::new()).await.unwrap() {
        DrainOutcome::Drained(summary) => summary,
        DrainOutcome::LockBusy => panic!("expected the runner lock to be free"),
    }
}

async fn enqueue_steps(store: &Store, company_id: &str, steps: &[StepKey]) {
    let payload = QueuePayload::new(AnalysisMode::Steps, Some(steps.to_vec()));
    store.enqueue(company_id, &payload, Some("tester")).await.unwrap();
    store.mark_queued(company_id).await.unwrap();
}

fn lookup_path(inn: &str) -> String {
    format!("/v1/lookup/{inn}/card")
}

fn step_calls(mock: &MockAi) -> Vec<String> {
    mock.calls()
        .into_iter()
        .filter(|c| c != "GET /health")
        .collect()
}

#[tokio::test]
async fn transient_step_errors_are_retried_without_defer() {
    let mock = MockAi::start().await;
    mock.script("GET", &lookup_path(INN), &[200]);
    mock.script("POST", "/v1/parse-site", &[500, 500, 200]);
    let store = test_store().await;
    let o = orchestrator(&store, config_for(&mock)).await;
    enqueue_steps(&store, INN, &[StepKey::Lookup, StepKey::ParseSite]).await;

    let summary = drain(&o).await;
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.deferred, 0);

    let state = store.get_state(INN).await.unwrap().unwrap();
    assert_eq!(state.status, AnalysisStatus::Completed);
    assert_eq!(state.progress, 1.0);
    assert!(state.analysis_ok);
    assert!(!state.server_error);
    assert!(state.last_finished_at.is_some());
    let info = state.info.unwrap();
    assert_eq!(info["completedSteps"], serde_json::json!(["lookup", "parse_site"]));
    assert_eq!(info["deferCount"], 0);
    assert_eq!(mock.hits("POST", "/v1/parse-site"), 3);
    assert_eq!(store.queue_len().await.unwrap(), 0);
}

#[tokio::test]
async fn progress_is_recorded_after_each_step() {
    let mock = MockAi::start().await;
    mock.all_ok(INN);
    mock.delay("POST", "/v1/parse-site", 400);
    let store = test_store().await;
    let o = orchestrator(&store, config_for(&mock)).await;
    enqueue_steps(&store, INN, &[StepKey::Lookup, StepKey::ParseSite]).await;

    let runner = o.clone();
    let handle = tokio::spawn(async move { drain(&runner).await });

    let mut seen = Vec::new();
    while !handle.is_finished() {
        if let Some(state) = store.get_state(INN).await.unwrap()
            && state.status == AnalysisStatus::Running
        {
            seen.push(state.progress);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let summary = handle.await.unwrap();
    assert_eq!(summary.completed, 1);

    assert!(seen.contains(&0.5), "progress samples: {:?}", seen);
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress samples: {:?}", seen);
    let state = store.get_state(INN).await.unwrap().unwrap();
    assert_eq!(state.progress, 1.0);
}

#[tokio::test]
async fn enqueue_during_run_is_processed_afterwards() {
    let mock = MockAi::start().await;
    mock.all_ok(INN);
    mock.delay("GET", &lookup_path(INN), 500);
    let store = test_store().await;
    let o = orchestrator(&store, config_for(&mock)).await;
    enqueue_steps(&store, INN, &[StepKey::Lookup]).await;

    let runner = o.clone();
    let handle = tokio::spawn(async move { drain(&runner).await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    store
        .enqueue(INN, &QueuePayload::new(AnalysisMode::Full, None), Some("tester"))
        .await
        .unwrap();
    store.mark_queued(INN).await.unwrap();
    let mid = store.get_state(INN).await.unwrap().unwrap();
    assert_eq!(mid.status, AnalysisStatus::Running);

    let summary = handle.await.unwrap();
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.completed, 2);
    assert_eq!(mock.hits("POST", "/v1/pipeline/full"), 1);
    assert_eq!(store.queue_len().await.unwrap(), 0);
    let state = store.get_state(INN).await.unwrap().unwrap();
    assert_eq!(state.status, AnalysisStatus::Completed);
}

#[tokio::test]
async fn exhausted_step_defers_then_fails_after_cap() {
    let mock = MockAi::start().await;
    mock.script("GET", &lookup_path(INN), &[200]);
    mock.script("POST", "/v1/parse-site", &[500]);
    let store = test_store().await;
    let o = orchestrator(&store, config_for(&mock)).await;
    enqueue_steps(&store, INN, &[StepKey::Lookup, StepKey::ParseSite]).await;

    // First pass on its own, to observe the deferred state.
    let item = store.dequeue_next().await.unwrap().unwrap();
    let outcome = o.process_job(item, &mut HashSet::new()).await;
    assert_eq!(outcome.status, JobPhase::Deferred);
    assert_eq!(outcome.completed_steps, vec![StepKey::Lookup]);
    assert_eq!(outcome.last_status, Some(500));

    let requeued = store.queued_item(INN).await.unwrap().unwrap();
    assert_eq!(requeued.payload.defer_count, 1);
    assert_eq!(requeued.payload.completed_steps, vec![StepKey::Lookup]);
    assert_eq!(requeued.queued_by.as_deref(), Some("tester"));
    let state = store.get_state(INN).await.unwrap().unwrap();
    assert_eq!(state.status, AnalysisStatus::Queued);
    assert_eq!(state.progress, 0.5);
    assert_eq!(mock.hits("POST", "/v1/parse-site"), 5);

    // The remaining passes run in one drain: two more defers, then failed.
    let summary = drain(&o).await;
    assert_eq!(summary.processed, 3);
    assert_eq!(summary.deferred, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.outcomes.len(), 1);
    assert_eq!(summary.outcomes[0].status, JobPhase::Failed);

    let state = store.get_state(INN).await.unwrap().unwrap();
    assert_eq!(state.status, AnalysisStatus::Failed);
    assert_eq!(state.progress, 0.5);
    assert!(state.server_error);
    assert!(!state.analysis_ok);
    assert_eq!(state.attempts, 4);
    assert_eq!(state.info.unwrap()["failedStep"], "parse_site");

    // Completed steps are never repeated across defers.
    assert_eq!(mock.hits("GET", &lookup_path(INN)), 1);
    assert_eq!(mock.hits("POST", "/v1/parse-site"), 20);
    assert_eq!(store.queue_len().await.unwrap(), 0);
}

#[tokio::test]
async fn deferred_job_goes_to_the_back_of_the_queue() {
    let mock = MockAi::start().await;
    mock.script("GET", &lookup_path("1001"), &[500]);
    mock.script("GET", &lookup_path("1002"), &[200]);
    mock.script("GET", &lookup_path("1003"), &[200]);
    let store = test_store().await;
    let o = orchestrator(
        &store,
        AnalysisConfig {
            step_attempts: 1,
            max_defers: 1,
            ..config_for(&mock)
        },
    )
    .await;
    for inn in ["1001", "1002", "1003"] {
        enqueue_steps(&store, inn, &[StepKey::Lookup]).await;
    }

    drain(&o).await;

    assert_eq!(
        step_calls(&mock),
        vec![
            "GET /v1/lookup/1001/card",
            "GET /v1/lookup/1002/card",
            "GET /v1/lookup/1003/card",
            "GET /v1/lookup/1001/card",
        ]
    );
    let first = store.get_state("1001").await.unwrap().unwrap();
    assert_eq!(first.status, AnalysisStatus::Failed);
}

#[tokio::test]
async fn fallback_is_used_only_for_wrong_shape() {
    let mock = MockAi::start().await;
    mock.script("POST", "/v1/ib-match", &[405]);
    mock.script("GET", &format!("/v1/ib-match/{INN}"), &[200]);
    let store = test_store().await;
    let o = orchestrator(&store, config_for(&mock)).await;
    enqueue_steps(&store, INN, &[StepKey::IbMatch]).await;

    let summary = drain(&o).await;
    assert_eq!(summary.completed, 1);
    assert_eq!(
        step_calls(&mock),
        vec![
            "POST /v1/ib-match".to_string(),
            format!("GET /v1/ib-match/{INN}"),
        ]
    );
}

#[tokio::test]
async fn held_lock_makes_drain_a_no_op() {
    let mock = MockAi::start().await;
    mock.all_ok(INN);
    let store = test_store().await;
    let o = orchestrator(&store, config_for(&mock)).await;
    enqueue_steps(&store, INN, &[StepKey::Lookup]).await;

    let other = RunnerLock::new(store.clone(), ANALYSIS_LOCK_KEY, Duration::from_secs(60));
    assert!(other.try_acquire().await.unwrap());

    let outcome = o.drain(&CancellationToken::new()).await.unwrap();
    assert!(matches!(outcome, DrainOutcome::LockBusy));
    assert_eq!(store.queue_len().await.unwrap(), 1);
    assert!(mock.calls().is_empty());
    assert_eq!(
        store.get_state(INN).await.unwrap().unwrap().status,
        AnalysisStatus::Queued
    );

    other.release().await.unwrap();
    let summary = drain(&o).await;
    assert_eq!(summary.completed, 1);
}

#[tokio::test]
async fn concurrent_drains_process_each_job_once() {
    let mock = MockAi::start().await;
    mock.all_ok(INN);
    let store = test_store().await;
    let a = orchestrator(&store, config_for(&mock)).await;
    let b = orchestrator(&store, config_for(&mock)).await;
    enqueue_steps(&store, INN, &[StepKey::Lookup]).await;

    let cancel = CancellationToken::new();
    let (ra, rb) = tokio::join!(a.drain(&cancel), b.drain(&cancel));
    let processed: usize = [ra.unwrap(), rb.unwrap()]
        .into_iter()
        .map(|o| match o {
            DrainOutcome::Drained(s) => s.processed,
            DrainOutcome::LockBusy => 0,
        })
        .sum();
    assert_eq!(processed, 1);
    assert_eq!(mock.hits("GET", &lookup_path(INN)), 1);

    // Lock released afterwards.
    let next_holder = RunnerLock::new(store.clone(), ANALYSIS_LOCK_KEY, Duration::from_secs(60));
    assert!(next_holder.try_acquire().await.unwrap());
}

#[tokio::test]
async fn stop_before_start_removes_job_without_failing_it() {
    let mock = MockAi::start().await;
    mock.all_ok("1001");
    mock.all_ok("1002");
    let store = test_store().await;
    let o = orchestrator(&store, config_for(&mock)).await;
    enqueue_steps(&store, "1001", &[StepKey::Lookup]).await;
    enqueue_steps(&store, "1002", &[StepKey::Lookup]).await;

    let ids = vec!["1002".to_string()];
    assert_eq!(store.request_stop(&ids).await.unwrap(), ids);
    store.add_stop_command(&ids).await.unwrap();

    drain(&o).await;

    let stopped = store.get_state("1002").await.unwrap().unwrap();
    assert_eq!(stopped.status, AnalysisStatus::Stopped);
    assert!(!stopped.server_error);
    assert!(stopped.last_finished_at.is_some());
    assert_eq!(mock.hits("GET", &lookup_path("1002")), 0);
    assert_eq!(
        store.get_state("1001").await.unwrap().unwrap().status,
        AnalysisStatus::Completed
    );
    assert_eq!(store.queue_len().await.unwrap(), 0);
}

#[tokio::test]
async fn stop_after_completion_has_no_effect() {
    let mock = MockAi::start().await;
    mock.all_ok("1001");
    mock.all_ok("1002");
    let store = test_store().await;
    let o = orchestrator(&store, config_for(&mock)).await;
    enqueue_steps(&store, "1001", &[StepKey::Lookup]).await;
    drain(&o).await;

    let ids = vec!["1001".to_string()];
    assert!(store.request_stop(&ids).await.unwrap().is_empty());
    store.add_stop_command(&ids).await.unwrap();
    enqueue_steps(&store, "1002", &[StepKey::Lookup]).await;
    drain(&o).await;

    let done = store.get_state("1001").await.unwrap().unwrap();
    assert_eq!(done.status, AnalysisStatus::Completed);
    assert!(done.analysis_ok);
}

#[tokio::test]
async fn stop_arriving_mid_run_marks_job_stopped() {
    let mock = MockAi::start().await;
    mock.all_ok(INN);
    let store = test_store().await;
    let o = orchestrator(&store, config_for(&mock)).await;
    enqueue_steps(&store, INN, &[StepKey::Lookup]).await;

    let item = store.dequeue_next().await.unwrap().unwrap();
    // Not observed until the in-flight execution returns.
    store.add_stop_command(&[INN.to_string()]).await.unwrap();
    let outcome = o.process_job(item, &mut HashSet::new()).await;

    assert_eq!(outcome.status, JobPhase::Stopped);
    assert_eq!(mock.hits("GET", &lookup_path(INN)), 1);
    let state = store.get_state(INN).await.unwrap().unwrap();
    assert_eq!(state.status, AnalysisStatus::Stopped);
    assert!(!state.analysis_ok);
    assert!(state.last_finished_at.is_some());
}

#[tokio::test]
async fn overall_timeout_yields_504() {
    let mock = MockAi::start().await;
    mock.script("GET", &lookup_path(INN), &[200]);
    mock.delay("GET", &lookup_path(INN), 2_000);
    let store = test_store().await;
    let o = orchestrator(
        &store,
        AnalysisConfig {
            job_timeout_ms: 100,
            max_defers: 0,
            ..config_for(&mock)
        },
    )
    .await;
    enqueue_steps(&store, INN, &[StepKey::Lookup]).await;

    let summary = drain(&o).await;
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.outcomes[0].last_status, Some(504));
    let state = store.get_state(INN).await.unwrap().unwrap();
    assert_eq!(state.status, AnalysisStatus::Failed);
    assert_eq!(state.info.unwrap()["lastStatus"], 504);
}

#[tokio::test]
async fn full_mode_calls_the_pipeline_endpoint_once() {
    let mock = MockAi::start().await;
    mock.all_ok(INN);
    let store = test_store().await;
    let o = orchestrator(&store, config_for(&mock)).await;
    store
        .enqueue(INN, &QueuePayload::new(AnalysisMode::Full, None), None)
        .await
        .unwrap();
    store.mark_queued(INN).await.unwrap();

    let summary = drain(&o).await;
    assert_eq!(summary.completed, 1);
    assert_eq!(step_calls(&mock), vec!["POST /v1/pipeline/full"]);
    assert_eq!(summary.outcomes[0].completed_steps, StepKey::ALL.to_vec());
}

#[tokio::test]
async fn no_valid_site_is_flagged() {
    let mock = MockAi::start().await;
    mock.script("POST", "/v1/parse-site", &[422]);
    mock.body(
        "POST",
        "/v1/parse-site",
        serde_json::json!({ "error": "no_valid_site" }),
    );
    let store = test_store().await;
    store
        .upsert_company(&CompanyRecord {
            inn: INN.to_string(),
            short_name: Some("Sberbank".to_string()),
            okved: None,
            industry: None,
            status: None,
        })
        .await
        .unwrap();
    let o = orchestrator(
        &store,
        AnalysisConfig {
            step_attempts: 1,
            max_defers: 0,
            ..config_for(&mock)
        },
    )
    .await;
    enqueue_steps(&store, INN, &[StepKey::ParseSite]).await;

    drain(&o).await;

    let state = store.get_state(INN).await.unwrap().unwrap();
    assert_eq!(state.status, AnalysisStatus::Failed);
    assert!(state.no_valid_site);
    let flags = store.company_flags(INN).await.unwrap().unwrap();
    assert!(flags.no_valid_site);
    assert!(flags.server_error);
    assert_eq!(flags.analysis_status.as_deref(), Some("failed"));
}

#[tokio::test]
async fn drain_records_lifecycle_notifications() {
    let mock = MockAi::start().await;
    mock.all_ok(INN);
    let store = test_store().await;
    store
        .upsert_company(&CompanyRecord {
            inn: INN.to_string(),
            short_name: Some("Sberbank".to_string()),
            okved: None,
            industry: None,
            status: None,
        })
        .await
        .unwrap();
    let o = orchestrator(&store, config_for(&mock)).await;
    enqueue_steps(&store, INN, &[StepKey::Lookup]).await;
    drain(&o).await;

    let notes = store
        .list_events(
            &EventFilter {
                category: EventCategory::Notification,
                ..Default::default()
            },
            1,
            50,
        )
        .await
        .unwrap();
    let keys: Vec<String> = notes
        .items
        .iter()
        .filter_map(|e| e.payload.as_ref()?.get("key")?.as_str().map(str::to_string))
        .collect();
    assert_eq!(
        keys,
        vec!["analysis_summary", "analysis_success", "analysis_start"]
    );
    assert_eq!(notes.items[1].company_name.as_deref(), Some("Sberbank"));

    let flags = store.company_flags(INN).await.unwrap().unwrap();
    assert!(flags.analysis_ok);
    assert!(flags.analysis_started_at.is_some());
}

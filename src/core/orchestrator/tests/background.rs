use std::sync::Arc;
use std::time::Duration;

use crate::core::config::AnalysisConfig;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::orchestrator::BackgroundRunner;
use crate::core::pipeline::mock::MockAi;
use crate::core::pipeline::{AnalysisMode, StepKey};
use crate::core::store::types::{AnalysisStatus, QueuePayload};
use crate::core::store::{Store, test_store};

fn fast_config(base: Option<String>) -> Arc<AnalysisConfig> {
    Arc::new(AnalysisConfig {
        integration_base_url: base,
        health_retry_delay_ms: 1,
        retry_delay_ms: 1,
        ..Default::default()
    })
}

async fn wait_for_status(store: &Store, inn: &str, status: AnalysisStatus) {
    for _ in 0..200 {
        if let Some(state) = store.get_state(inn).await.unwrap()
            && state.status == status
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{} never reached {:?}", inn, status);
}

async fn enqueue(store: &Store, inn: &str) {
    let payload = QueuePayload::new(AnalysisMode::Steps, Some(vec![StepKey::Lookup]));
    store.enqueue(inn, &payload, None).await.unwrap();
    store.mark_queued(inn).await.unwrap();
}

#[tokio::test]
async fn kick_drains_in_the_background() {
    let mock = MockAi::start().await;
    mock.all_ok("1001");
    let store = test_store().await;
    let runner = BackgroundRunner::new(store.clone(), fast_config(Some(mock.base.clone())));
    assert!(runner.is_enabled());

    enqueue(&store, "1001").await;
    assert!(runner.kick());
    wait_for_status(&store, "1001", AnalysisStatus::Completed).await;

    runner.shutdown().await;
    assert!(!runner.kick());
}

#[tokio::test]
async fn start_resumes_leftover_queue() {
    let mock = MockAi::start().await;
    mock.all_ok("1002");
    let store = test_store().await;
    enqueue(&store, "1002").await;

    let mut runner = BackgroundRunner::new(store.clone(), fast_config(Some(mock.base.clone())));
    runner.on_start().await.unwrap();
    wait_for_status(&store, "1002", AnalysisStatus::Completed).await;
    runner.on_shutdown().await.unwrap();
}

#[tokio::test]
async fn runner_without_integration_is_disabled() {
    let store = test_store().await;
    let runner = BackgroundRunner::new(store.clone(), fast_config(None));
    assert!(!runner.is_enabled());
    enqueue(&store, "1003").await;
    assert!(!runner.kick());
    assert_eq!(store.queue_len().await.unwrap(), 1);
}

#[tokio::test]
async fn sweep_job_accepts_default_cron() {
    let store = test_store().await;
    let runner = BackgroundRunner::new(store, fast_config(Some("http://127.0.0.1:9".to_string())));
    let cron = AnalysisConfig::default().sweep_cron.unwrap();
    assert!(runner.sweep_job(&cron).is_ok());
}

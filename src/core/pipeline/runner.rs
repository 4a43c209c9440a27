use std::sync::Arc;
use tracing::{debug, warn};

use super::client::IntegrationClient;
use super::registry::{FULL_PIPELINE, StepDefinition, is_shape_mismatch, step_definition};
use super::{StepKey, StepResult};
use crate::core::config::AnalysisConfig;
use crate::core::store::Store;
use crate::core::store::types::{EventType, NewEvent};

/// Event source for all traffic to the AI service.
pub const INTEGRATION_SOURCE: &str = "ai-integration";

/// Executes steps against the AI service with health probes, fallbacks and
/// retry rounds. Every outcome is returned as a `StepResult`; nothing here
/// returns an error.
#[derive(Clone)]
pub struct StepRunner {
    client: IntegrationClient,
    store: Store,
    config: Arc<AnalysisConfig>,
}

impl StepRunner {
    pub fn new(client: IntegrationClient, store: Store, config: Arc<AnalysisConfig>) -> Self {
        Self {
            client,
            store,
            config,
        }
    }

    pub fn client(&self) -> &IntegrationClient {
        &self.client
    }

    pub async fn run_step(&self, company_id: &str, step: StepKey) -> StepResult {
        self.run_definition(company_id, step_definition(step)).await
    }

    pub async fn run_full_pipeline(&self, company_id: &str) -> StepResult {
        self.run_definition(company_id, &FULL_PIPELINE).await
    }

    async fn run_definition(&self, company_id: &str, def: &StepDefinition) -> StepResult {
        let rounds = self.config.step_attempts.max(1);
        let mut last = StepResult::failure(0, "not attempted");

        for round in 1..=rounds {
            let probe = self.client.health().await;
            if !probe.ok {
                let error = probe
                    .error
                    .unwrap_or_else(|| format!("HTTP {}", probe.status));
                self.log(
                    NewEvent::new(EventType::Error, INTEGRATION_SOURCE)
                        .with_company(company_id)
                        .with_message(format!(
                            "health check failed before {} (round {}/{}): {}",
                            def.name, round, rounds, error
                        ))
                        .with_payload(serde_json::json!({
                            "step": def.name,
                            "round": round,
                            "status": probe.status,
                        })),
                )
                .await;
                last = StepResult::failure(probe.status, error);
                if round < rounds {
                    tokio::time::sleep(self.config.health_retry_delay()).await;
                }
                continue;
            }

            for attempt in def.attempts() {
                let request_id = uuid::Uuid::new_v4().to_string();
                let path = attempt.render_path(company_id);
                let call_info = serde_json::json!({
                    "step": def.name,
                    "label": attempt.label,
                    "method": attempt.method.as_str(),
                    "path": path,
                    "round": round,
                });

                self.log(
                    NewEvent::new(EventType::Request, INTEGRATION_SOURCE)
                        .with_direction("outbound")
                        .with_request_id(&request_id)
                        .with_company(company_id)
                        .with_message(format!("{} {}", attempt.method.as_str(), path))
                        .with_payload(call_info.clone()),
                )
                .await;

                let res = self.client.call(attempt, company_id).await;
                if res.ok {
                    self.log(
                        NewEvent::new(EventType::Response, INTEGRATION_SOURCE)
                            .with_direction("inbound")
                            .with_request_id(&request_id)
                            .with_company(company_id)
                            .with_message(format!("{} {} -> {}", attempt.method.as_str(), path, res.status))
                            .with_payload(call_info)
                            .with_payload(serde_json::json!({ "status": res.status })),
                    )
                    .await;
                    debug!("{} for {} succeeded via {}", def.name, company_id, attempt.label);
                    return StepResult::success(res.status, res.body);
                }

                let error = res
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("HTTP {}", res.status));
                self.log(
                    NewEvent::new(EventType::Error, INTEGRATION_SOURCE)
                        .with_direction("inbound")
                        .with_request_id(&request_id)
                        .with_company(company_id)
                        .with_message(format!(
                            "{} {} -> {}: {}",
                            attempt.method.as_str(),
                            path,
                            res.status,
                            error
                        ))
                        .with_payload(call_info)
                        .with_payload(serde_json::json!({ "status": res.status, "error": error })),
                )
                .await;

                let status = res.status;
                last = StepResult {
                    ok: false,
                    status,
                    error: Some(error),
                    body: res.body,
                };
                if !is_shape_mismatch(status) {
                    break;
                }
            }

            if round < rounds {
                tokio::time::sleep(self.config.retry_delay(round)).await;
            }
        }

        warn!(
            "{} for {} failed after {} rounds: {} {}",
            def.name,
            company_id,
            rounds,
            last.status,
            last.error.as_deref().unwrap_or("")
        );
        last
    }

    async fn log(&self, event: NewEvent) {
        if let Err(e) = self.store.append_event(&event).await {
            warn!("Failed to record integration event: {}", e);
        }
    }
}

use axum::{
    Json,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

use super::super::AppState;
use super::{ApiResult, internal_error, normalize_ids, reject, requested_by};
use crate::core::pipeline::{AnalysisMode, IntegrationClient, StepKey};
use crate::core::store::types::{NewEvent, QueuePayload};

#[derive(Debug, Default, Deserialize)]
pub struct RunAnalysisRequest {
    #[serde(default)]
    inns: Vec<String>,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    steps: Option<Vec<String>>,
}

/// What a batch of companies should be enqueued with.
pub(crate) struct EnqueueRequest {
    pub inns: Vec<String>,
    pub mode: Option<String>,
    pub steps: Option<Vec<String>>,
    pub extra: Option<Value>,
    pub queued_by: Option<String>,
    pub source: &'static str,
}

pub async fn health_endpoint() -> Json<Value> {
    Json(json!({ "ok": true }))
}

pub async fn run_analysis_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RunAnalysisRequest>,
) -> ApiResult {
    enqueue_companies(
        &state,
        EnqueueRequest {
            inns: normalize_ids(&body.inns),
            mode: body.mode,
            steps: body.steps,
            extra: body.payload,
            queued_by: requested_by(&headers),
            source: "api",
        },
    )
    .await
}

fn resolve_mode(state: &AppState, requested: Option<&str>) -> Result<AnalysisMode, String> {
    if let Some(forced) = state.config.force_mode {
        return Ok(forced);
    }
    match requested.map(str::trim).filter(|m| !m.is_empty()) {
        Some(m) => AnalysisMode::from_str(m),
        None => Ok(AnalysisMode::default()),
    }
}

fn resolve_steps(
    state: &AppState,
    requested: Option<&[String]>,
) -> Result<Option<Vec<StepKey>>, String> {
    if let Some(forced) = &state.config.force_steps
        && !forced.is_empty()
    {
        return Ok(Some(forced.clone()));
    }
    let Some(requested) = requested else {
        return Ok(None);
    };
    let mut steps = Vec::new();
    for name in requested.iter().filter(|s| !s.trim().is_empty()) {
        let step = StepKey::from_str(name)?;
        if !steps.contains(&step) {
            steps.push(step);
        }
    }
    Ok((!steps.is_empty()).then_some(steps))
}

fn unix_millis() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
        .to_string()
}

/// Validate, probe the service, enqueue and wake the background runner.
pub(crate) async fn enqueue_companies(state: &AppState, req: EnqueueRequest) -> ApiResult {
    if req.inns.is_empty() {
        return Err(reject(StatusCode::BAD_REQUEST, "No companies to analyze"));
    }
    let Some(base) = state.config.integration_base() else {
        return Err(reject(
            StatusCode::SERVICE_UNAVAILABLE,
            "AI integration is not configured",
        ));
    };
    let mode = resolve_mode(state, req.mode.as_deref())
        .map_err(|e| reject(StatusCode::BAD_REQUEST, e))?;
    let steps = resolve_steps(state, req.steps.as_deref())
        .map_err(|e| reject(StatusCode::BAD_REQUEST, e))?;

    let client = IntegrationClient::new(
        &base,
        state.config.step_timeout(),
        state.config.health_timeout(),
    )
    .map_err(|e| {
        reject(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("AI integration is misconfigured: {}", e),
        )
    })?;
    let health = client.health().await;
    if !health.ok {
        warn!("AI integration unhealthy at {}: HTTP {}", base, health.status);
        return Err((
            StatusCode::BAD_GATEWAY,
            Json(json!({
                "ok": false,
                "error": format!(
                    "AI integration is unavailable: {}",
                    health.error.unwrap_or_else(|| format!("HTTP {}", health.status))
                ),
                "status": health.status,
                "integration": { "base": base },
            })),
        ));
    }

    let mut payload = QueuePayload::new(mode, steps);
    payload.source = req.source.to_string();
    payload.requested_at = Some(unix_millis());
    payload.extra = req.extra;

    for inn in &req.inns {
        state
            .store
            .enqueue(inn, &payload, req.queued_by.as_deref())
            .await
            .map_err(internal_error)?;
        state.store.mark_queued(inn).await.map_err(internal_error)?;
    }
    info!(
        "Queued {} companies for {} analysis",
        req.inns.len(),
        mode.as_str()
    );
    state.runner.kick();

    let steps: Option<Vec<&str>> = match mode {
        AnalysisMode::Full => None,
        AnalysisMode::Steps => Some(payload.planned_steps().iter().map(|s| s.as_str()).collect()),
    };
    Ok(Json(json!({
        "ok": true,
        "queued": req.inns.len(),
        "mode": mode,
        "steps": steps,
        "integration": { "base": base },
    })))
}

#[derive(Debug, Deserialize)]
pub struct StateQuery {
    #[serde(default)]
    inn: Option<String>,
}

pub async fn get_state_endpoint(
    State(state): State<AppState>,
    Query(query): Query<StateQuery>,
) -> ApiResult {
    let ids = normalize_ids(query.inn.as_deref().unwrap_or_default().split(','));
    if ids.is_empty() {
        return Err(reject(StatusCode::BAD_REQUEST, "inn is required"));
    }
    let items = state.store.get_states(&ids).await.map_err(internal_error)?;
    Ok(Json(json!({ "ok": true, "items": items })))
}

#[derive(Debug, Deserialize)]
pub struct StopRequest {
    #[serde(default)]
    inns: Vec<String>,
}

pub async fn stop_analysis_endpoint(
    State(state): State<AppState>,
    Json(body): Json<StopRequest>,
) -> ApiResult {
    let ids = normalize_ids(&body.inns);
    if ids.is_empty() {
        return Err(reject(StatusCode::BAD_REQUEST, "No companies to stop"));
    }

    let flagged = state.store.request_stop(&ids).await.map_err(internal_error)?;
    if !flagged.is_empty() {
        state
            .store
            .add_stop_command(&flagged)
            .await
            .map_err(internal_error)?;
        let event = NewEvent::notification(
            "analysis_stop_requested",
            None,
            format!("Stop requested for {} companies", flagged.len()),
        )
        .with_payload(json!({ "companyIds": flagged }));
        if let Err(e) = state.store.append_event(&event).await {
            warn!("Failed to log stop request: {}", e);
        }
        // An idle runner consumes the command and marks queued rows stopped.
        state.runner.kick();
    }

    Ok(Json(json!({
        "ok": true,
        "requested": ids.len(),
        "stopping": flagged,
    })))
}

use axum::{
    Json,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use super::super::AppState;
use super::analysis::{EnqueueRequest, enqueue_companies};
use super::{ApiResult, internal_error, normalize_ids, reject, requested_by};
use crate::core::store::types::CompanyFilter;

const DEFAULT_QUEUE_LIMIT: usize = 100;
const MAX_QUEUE_LIMIT: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct QueueQuery {
    #[serde(default)]
    limit: Option<usize>,
}

pub async fn list_queue_endpoint(
    State(state): State<AppState>,
    Query(query): Query<QueueQuery>,
) -> ApiResult {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_QUEUE_LIMIT)
        .clamp(1, MAX_QUEUE_LIMIT);
    let queued = state.store.list_queue(limit).await.map_err(internal_error)?;
    let running = state
        .store
        .list_active_states(limit)
        .await
        .map_err(internal_error)?;
    let total = state.store.queue_len().await.map_err(internal_error)?;

    Ok(Json(json!({
        "ok": true,
        "total": total,
        "items": queued,
        "running": running,
        "runner": {
            "enabled": state.runner.is_enabled(),
            "busy": state.runner.is_busy(),
        },
    })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkEnqueueRequest {
    #[serde(flatten)]
    filter: CompanyFilter,
    #[serde(default)]
    dry_run: bool,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    steps: Option<Vec<String>>,
    #[serde(default)]
    payload: Option<Value>,
}

pub async fn bulk_enqueue_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<BulkEnqueueRequest>,
) -> ApiResult {
    let limit = body
        .limit
        .unwrap_or(MAX_QUEUE_LIMIT)
        .clamp(1, MAX_QUEUE_LIMIT);
    let ids = state
        .store
        .find_company_ids(&body.filter, limit)
        .await
        .map_err(internal_error)?;

    if body.dry_run {
        return Ok(Json(json!({
            "ok": true,
            "dryRun": true,
            "matched": ids.len(),
            "inns": ids,
        })));
    }

    info!("Bulk enqueue matched {} companies", ids.len());
    enqueue_companies(
        &state,
        EnqueueRequest {
            inns: ids,
            mode: body.mode,
            steps: body.steps,
            extra: body.payload,
            queued_by: requested_by(&headers),
            source: "bulk",
        },
    )
    .await
}

#[derive(Debug, Deserialize)]
pub struct DequeueRequest {
    #[serde(default)]
    inns: Vec<String>,
}

pub async fn remove_from_queue_endpoint(
    State(state): State<AppState>,
    Json(body): Json<DequeueRequest>,
) -> ApiResult {
    let ids = normalize_ids(&body.inns);
    if ids.is_empty() {
        return Err(reject(StatusCode::BAD_REQUEST, "No companies to remove"));
    }

    let removed = state
        .store
        .remove_from_queue(&ids)
        .await
        .map_err(internal_error)?;
    let reset = state.store.reset_states(&ids).await.map_err(internal_error)?;
    state
        .store
        .reset_company_flags(&ids)
        .await
        .map_err(internal_error)?;

    Ok(Json(json!({
        "ok": true,
        "removed": removed,
        "reset": reset,
    })))
}

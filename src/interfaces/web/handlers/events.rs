use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::super::AppState;
use super::{ApiResult, internal_error, reject};
use crate::core::store::MAX_PAGE_SIZE;
use crate::core::store::types::{EventCategory, EventFilter, NewEvent};

const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    q: Option<String>,
    #[serde(default)]
    company_id: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    page: Option<usize>,
    #[serde(default)]
    page_size: Option<usize>,
}

pub async fn list_events_endpoint(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> ApiResult {
    let category = EventCategory::parse(query.category.as_deref().unwrap_or_default())
        .ok_or_else(|| reject(StatusCode::BAD_REQUEST, "Unknown event category"))?;
    let filter = EventFilter {
        category,
        query: query.q,
        company_id: query.company_id,
        source: query.source,
        from: query.from,
        to: query.to,
    };
    let page = query.page.unwrap_or(1).max(1);
    let page_size = query
        .page_size
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);

    let result = state
        .store
        .list_events(&filter, page, page_size)
        .await
        .map_err(internal_error)?;

    Ok(Json(json!({
        "ok": true,
        "items": result.items,
        "total": result.total,
        "page": result.page,
        "pageSize": result.page_size,
    })))
}

pub async fn append_event_endpoint(
    State(state): State<AppState>,
    Json(event): Json<NewEvent>,
) -> ApiResult {
    let record = state
        .store
        .append_event(&event)
        .await
        .map_err(internal_error)?;
    Ok(Json(json!({ "ok": true, "item": record })))
}

pub async fn purge_events_endpoint(State(state): State<AppState>) -> ApiResult {
    let removed = state.store.purge_events().await.map_err(internal_error)?;
    info!("Purged {} analysis events", removed);
    Ok(Json(json!({ "ok": true, "removed": removed })))
}

pub mod analysis;
pub mod companies;
pub mod events;
pub mod queue;

use axum::{
    Json,
    http::{HeaderMap, StatusCode},
};
use serde_json::{Value, json};
use tracing::error;

pub(crate) type ApiError = (StatusCode, Json<Value>);
pub(crate) type ApiResult = Result<Json<Value>, ApiError>;

pub(crate) fn reject(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(json!({ "ok": false, "error": message.into() })),
    )
}

pub(crate) fn internal_error(e: anyhow::Error) -> ApiError {
    error!("Request failed: {:#}", e);
    reject(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

/// Trim, drop blanks and duplicates. Order is kept.
pub(crate) fn normalize_ids<I, S>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for id in raw {
        let id = id.as_ref().trim();
        if !id.is_empty() && !out.iter().any(|x| x == id) {
            out.push(id.to_string());
        }
    }
    out
}

pub(crate) fn requested_by(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-requested-by")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_ids_trims_and_dedupes() {
        let ids = normalize_ids([" 7707083893", "", "7707083893", "500100732259 "]);
        assert_eq!(ids, vec!["7707083893", "500100732259"]);
    }
}

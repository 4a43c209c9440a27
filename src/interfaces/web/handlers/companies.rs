use axum::{Json, extract::State, http::StatusCode};
use serde::Deserialize;
use serde_json::json;

use super::super::AppState;
use super::{ApiResult, internal_error, reject};
use crate::core::store::types::CompanyRecord;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ImportCompaniesRequest {
    Batch { companies: Vec<CompanyRecord> },
    Single(CompanyRecord),
}

/// Administrative import into the companies directory.
pub async fn import_companies_endpoint(
    State(state): State<AppState>,
    Json(body): Json<ImportCompaniesRequest>,
) -> ApiResult {
    let companies = match body {
        ImportCompaniesRequest::Batch { companies } => companies,
        ImportCompaniesRequest::Single(company) => vec![company],
    };

    let mut imported = 0;
    for mut company in companies {
        company.inn = company.inn.trim().to_string();
        if company.inn.is_empty() {
            return Err(reject(StatusCode::BAD_REQUEST, "Company inn is required"));
        }
        state
            .store
            .upsert_company(&company)
            .await
            .map_err(internal_error)?;
        imported += 1;
    }

    Ok(Json(json!({ "ok": true, "imported": imported })))
}

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::AppState;

pub(crate) const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Gate for destructive endpoints. Without a configured token nobody is admin.
pub async fn require_admin(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = state
        .config
        .admin_token
        .as_deref()
        .filter(|t| !t.is_empty())
    else {
        return forbidden("Admin token is not configured");
    };

    let provided = req
        .headers()
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim);

    match provided {
        Some(token) if token == expected => next.run(req).await,
        _ => forbidden("Admin token required"),
    }
}

fn forbidden(message: &str) -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(serde_json::json!({ "ok": false, "error": message })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::AnalysisConfig;
    use crate::core::orchestrator::BackgroundRunner;
    use crate::core::store::test_store;
    use axum::{Router, middleware, routing::get};
    use std::sync::Arc;
    use tower::util::ServiceExt;

    async fn guarded(admin_token: Option<&str>) -> Router {
        let store = test_store().await;
        let config = Arc::new(AnalysisConfig {
            admin_token: admin_token.map(str::to_string),
            ..Default::default()
        });
        let runner = BackgroundRunner::new(store.clone(), config.clone());
        let (log_tx, _) = tokio::sync::broadcast::channel(8);
        let state = AppState::new(store, config, runner, log_tx);

        Router::new()
            .route("/guarded", get(|| async { "ok" }))
            .layer(middleware::from_fn_with_state(state.clone(), require_admin))
            .with_state(state)
    }

    async fn status_with(app: Router, token: Option<&str>) -> StatusCode {
        let mut req = Request::builder().uri("/guarded");
        if let Some(token) = token {
            req = req.header(ADMIN_TOKEN_HEADER, token);
        }
        app.oneshot(req.body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn matching_token_passes() {
        let app = guarded(Some("s3cret")).await;
        assert_eq!(status_with(app, Some("s3cret")).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn wrong_or_missing_token_is_forbidden() {
        let app = guarded(Some("s3cret")).await;
        assert_eq!(
            status_with(app.clone(), Some("nope")).await,
            StatusCode::FORBIDDEN
        );
        assert_eq!(status_with(app, None).await, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn unconfigured_token_denies_everyone() {
        let app = guarded(None).await;
        assert_eq!(status_with(app, Some("")).await, StatusCode::FORBIDDEN);
    }
}

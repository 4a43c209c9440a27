use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Method, Request, header},
    middleware,
    middleware::Next,
    routing::{delete, get, post},
};
use tower_http::cors::CorsLayer;

use super::AppState;
use super::auth;
use super::handlers::{analysis, companies, events, queue};

fn build_localhost_cors(port: u16) -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        format!("http://127.0.0.1:{}", port),
        format!("http://localhost:{}", port),
    ]
    .iter()
    .filter_map(|o| o.parse().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
}

pub fn build_api_router(state: AppState) -> Router {
    let purge_events = delete(events::purge_events_endpoint).route_layer(
        middleware::from_fn_with_state(state.clone(), auth::require_admin),
    );

    Router::new()
        .route("/health", get(analysis::health_endpoint))
        .route("/analysis/run", post(analysis::run_analysis_endpoint))
        .route(
            "/analysis/queue",
            get(queue::list_queue_endpoint)
                .post(queue::bulk_enqueue_endpoint)
                .delete(queue::remove_from_queue_endpoint),
        )
        .route("/analysis/state", get(analysis::get_state_endpoint))
        .route("/analysis/stop", post(analysis::stop_analysis_endpoint))
        .route("/companies", post(companies::import_companies_endpoint))
        .route(
            "/debug/events",
            get(events::list_events_endpoint)
                .post(events::append_event_endpoint)
                .merge(purge_events),
        )
        .route("/debug/logs", get(super::sse_logs_endpoint))
        .layer(middleware::from_fn(security_headers))
        .layer(build_localhost_cors(state.config.port))
        .with_state(state)
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    response
}

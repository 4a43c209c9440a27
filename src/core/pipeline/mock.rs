//! Scripted in-process stand-in for the external AI service.

use axum::Router;
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Json};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct MockState {
    scripts: HashMap<String, VecDeque<u16>>,
    bodies: HashMap<String, serde_json::Value>,
    delays: HashMap<String, u64>,
    hits: Vec<String>,
    default_status: u16,
}

pub struct MockAi {
    pub base: String,
    state: Arc<Mutex<MockState>>,
    handle: tokio::task::JoinHandle<()>,
}

fn route_key(method: &str, path: &str) -> String {
    format!("{} {}", method.to_uppercase(), path)
}

async fn respond(
    State(state): State<Arc<Mutex<MockState>>>,
    method: Method,
    uri: Uri,
) -> impl IntoResponse {
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());
    let key = route_key(method.as_str(), &path);

    let (status, body, delay_ms) = {
        let mut st = state.lock().unwrap();
        st.hits.push(key.clone());
        let default_status = if key == "GET /health" {
            200
        } else {
            st.default_status
        };
        let code = match st.scripts.get_mut(&key) {
            // The last scripted status sticks.
            Some(q) if q.len() > 1 => q.pop_front().unwrap_or(default_status),
            Some(q) => q.front().copied().unwrap_or(default_status),
            None => default_status,
        };
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = match st.bodies.get(&key) {
            Some(body) => body.clone(),
            None if status.is_success() => serde_json::json!({ "ok": true, "route": key }),
            None => serde_json::json!({ "error": format!("scripted {}", code) }),
        };
        (status, body, st.delays.get(&key).copied())
    };
    if let Some(ms) = delay_ms {
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
    }
    (status, Json(body))
}

impl MockAi {
    /// Unscripted routes answer 404, except `GET /health` which answers 200.
    pub async fn start() -> Self {
        let state = Arc::new(Mutex::new(MockState {
            default_status: 404,
            ..Default::default()
        }));
        let app = Router::new().fallback(respond).with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            base: format!("http://{}", addr),
            state,
            handle,
        }
    }

    /// Queue statuses for a route; the last one repeats forever.
    pub fn script(&self, method: &str, path: &str, statuses: &[u16]) {
        let mut st = self.state.lock().unwrap();
        st.scripts
            .insert(route_key(method, path), statuses.iter().copied().collect());
    }

    pub fn body(&self, method: &str, path: &str, body: serde_json::Value) {
        let mut st = self.state.lock().unwrap();
        st.bodies.insert(route_key(method, path), body);
    }

    /// Hold every response on this route for `ms` milliseconds.
    pub fn delay(&self, method: &str, path: &str, ms: u64) {
        let mut st = self.state.lock().unwrap();
        st.delays.insert(route_key(method, path), ms);
    }

    pub fn set_default_status(&self, status: u16) {
        self.state.lock().unwrap().default_status = status;
    }

    /// Script the primary attempt of every step and the full pipeline to succeed.
    pub fn all_ok(&self, company_id: &str) {
        use super::{FULL_PIPELINE, StepKey, step_definition};
        for step in StepKey::ALL {
            let primary = step_definition(step).primary;
            self.script(
                primary.method.as_str(),
                &primary.render_path(company_id),
                &[200],
            );
        }
        self.script("POST", FULL_PIPELINE.primary.path, &[200]);
    }

    pub fn hits(&self, method: &str, path: &str) -> usize {
        let key = route_key(method, path);
        self.state
            .lock()
            .unwrap()
            .hits
            .iter()
            .filter(|h| **h == key)
            .count()
    }

    /// Every request received, as `METHOD path`, in arrival order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().hits.clone()
    }
}

impl Drop for MockAi {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

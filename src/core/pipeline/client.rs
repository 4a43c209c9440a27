use anyhow::Result;
use reqwest::Client;
use std::time::Duration;

use super::registry::{AttemptMethod, StepAttempt};

/// Longest error text kept from a non-JSON response body.
const ERROR_TEXT_LIMIT: usize = 500;

/// What came back from a single HTTP attempt. Transport failures are folded
/// in as synthetic statuses: 504 for timeouts, 502 for everything else.
#[derive(Debug, Clone)]
pub struct AttemptResponse {
    pub ok: bool,
    pub status: u16,
    pub error: Option<String>,
    pub body: Option<serde_json::Value>,
}

impl AttemptResponse {
    fn transport(err: reqwest::Error, timeout: Duration) -> Self {
        let (status, error) = if err.is_timeout() {
            (504, format!("timed out after {} ms", timeout.as_millis()))
        } else {
            (502, format!("request failed: {}", err))
        };
        Self {
            ok: false,
            status,
            error: Some(error),
            body: None,
        }
    }
}

/// Thin client for the external AI service.
#[derive(Clone)]
pub struct IntegrationClient {
    base: String,
    client: Client,
    step_timeout: Duration,
    health_timeout: Duration,
}

impl IntegrationClient {
    pub fn new(base: &str, step_timeout: Duration, health_timeout: Duration) -> Result<Self> {
        let parsed = url::Url::parse(base)?;
        if !matches!(parsed.scheme(), "http" | "https") {
            anyhow::bail!("integration base must be http(s), got '{}'", base);
        }
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            client: Client::builder().build()?,
            step_timeout,
            health_timeout,
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// `GET /health` on the service.
    pub async fn health(&self) -> AttemptResponse {
        let url = format!("{}/health", self.base);
        match self
            .client
            .get(&url)
            .timeout(self.health_timeout)
            .send()
            .await
        {
            Ok(res) => read_response(res).await,
            Err(e) => AttemptResponse::transport(e, self.health_timeout),
        }
    }

    pub async fn call(&self, attempt: &StepAttempt, company_id: &str) -> AttemptResponse {
        let url = format!("{}{}", self.base, attempt.render_path(company_id));
        let mut request = match attempt.method {
            AttemptMethod::Get => self.client.get(&url),
            AttemptMethod::Post => self.client.post(&url),
        };
        if attempt.has_body {
            request = request.json(&serde_json::json!({ "inn": company_id }));
        }
        match request.timeout(self.step_timeout).send().await {
            Ok(res) => read_response(res).await,
            Err(e) => AttemptResponse::transport(e, self.step_timeout),
        }
    }
}

async fn read_response(res: reqwest::Response) -> AttemptResponse {
    let status = res.status();
    let text = res.text().await.unwrap_or_default();
    let body = serde_json::from_str::<serde_json::Value>(&text).ok();

    if status.is_success() {
        return AttemptResponse {
            ok: true,
            status: status.as_u16(),
            error: None,
            body,
        };
    }

    let error = body
        .as_ref()
        .and_then(error_from_body)
        .unwrap_or_else(|| {
            if text.trim().is_empty() {
                format!("HTTP {}", status.as_u16())
            } else {
                text.chars().take(ERROR_TEXT_LIMIT).collect()
            }
        });
    AttemptResponse {
        ok: false,
        status: status.as_u16(),
        error: Some(error),
        body,
    }
}

/// `error` or `detail` from a JSON error body. `detail` may be an object.
fn error_from_body(body: &serde_json::Value) -> Option<String> {
    for field in ["error", "detail"] {
        match body.get(field) {
            Some(serde_json::Value::String(s)) => {
                if !s.is_empty() {
                    return Some(s.clone());
                }
            }
            Some(serde_json::Value::Null) | None => {}
            Some(other) => return Some(other.to_string()),
        }
    }
    None
}

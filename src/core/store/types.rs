use serde::{Deserialize, Serialize};

use crate::core::pipeline::{AnalysisMode, StepKey};

/// Payload carried by a queued analysis job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuePayload {
    #[serde(default = "default_source")]
    pub source: String,
    pub mode: AnalysisMode,
    #[serde(default)]
    pub steps: Option<Vec<StepKey>>,
    #[serde(default)]
    pub defer_count: u32,
    #[serde(default)]
    pub completed_steps: Vec<StepKey>,
    #[serde(default)]
    pub requested_at: Option<String>,
    /// Opaque caller payload forwarded for audit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

fn default_source() -> String {
    "api".to_string()
}

impl QueuePayload {
    pub fn new(mode: AnalysisMode, steps: Option<Vec<StepKey>>) -> Self {
        Self {
            source: default_source(),
            mode,
            steps,
            defer_count: 0,
            completed_steps: Vec::new(),
            requested_at: None,
            extra: None,
        }
    }

    /// Steps that still have to run for this job, in order.
    pub fn remaining_steps(&self) -> Vec<StepKey> {
        self.planned_steps()
            .into_iter()
            .filter(|s| !self.completed_steps.contains(s))
            .collect()
    }

    pub fn planned_steps(&self) -> Vec<StepKey> {
        match &self.steps {
            Some(steps) if !steps.is_empty() => steps.clone(),
            _ => StepKey::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub company_id: String,
    pub queued_at: String,
    pub queued_by: Option<String>,
    pub payload: QueuePayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Idle,
    Queued,
    Running,
    Stopping,
    Stopped,
    Completed,
    Failed,
}

impl AnalysisStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisStatus::Idle => "idle",
            AnalysisStatus::Queued => "queued",
            AnalysisStatus::Running => "running",
            AnalysisStatus::Stopping => "stopping",
            AnalysisStatus::Stopped => "stopped",
            AnalysisStatus::Completed => "completed",
            AnalysisStatus::Failed => "failed",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(AnalysisStatus::Idle),
            "queued" => Some(AnalysisStatus::Queued),
            "running" => Some(AnalysisStatus::Running),
            "stopping" => Some(AnalysisStatus::Stopping),
            "stopped" => Some(AnalysisStatus::Stopped),
            "completed" => Some(AnalysisStatus::Completed),
            "failed" => Some(AnalysisStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AnalysisStatus::Completed | AnalysisStatus::Failed | AnalysisStatus::Stopped
        )
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyAnalysisState {
    pub company_id: String,
    pub status: AnalysisStatus,
    pub stage: Option<String>,
    pub progress: f64,
    pub last_started_at: Option<String>,
    pub last_finished_at: Option<String>,
    pub duration_seconds: Option<f64>,
    pub attempts: i64,
    pub stop_requested: bool,
    pub analysis_ok: bool,
    pub server_error: bool,
    pub no_valid_site: bool,
    pub info: Option<serde_json::Value>,
    pub updated_at: String,
}

/// Terminal data written when a job leaves the `running` state.
#[derive(Debug, Clone)]
pub struct FinishedState<'a> {
    pub status: AnalysisStatus,
    pub progress: Option<f64>,
    pub duration_seconds: f64,
    pub analysis_ok: bool,
    pub server_error: bool,
    pub info: &'a serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopCommand {
    pub action: String,
    pub payload: StopPayload,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopPayload {
    pub company_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Request,
    Response,
    Error,
    Notification,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Request => "request",
            EventType::Response => "response",
            EventType::Error => "error",
            EventType::Notification => "notification",
        }
    }

    pub fn from_str_opt(value: &str) -> Option<Self> {
        match value {
            "request" => Some(EventType::Request),
            "response" => Some(EventType::Response),
            "error" => Some(EventType::Error),
            "notification" => Some(EventType::Notification),
            _ => None,
        }
    }
}

/// An event ready to be appended to the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEvent {
    pub event_type: EventType,
    #[serde(default = "default_event_source")]
    pub source: String,
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub company_id: Option<String>,
    #[serde(default)]
    pub company_name: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

fn default_event_source() -> String {
    "manual".to_string()
}

impl NewEvent {
    pub fn new(event_type: EventType, source: &str) -> Self {
        Self {
            event_type,
            source: source.to_string(),
            direction: None,
            request_id: None,
            company_id: None,
            company_name: None,
            message: None,
            payload: None,
        }
    }

    /// Notification carrying a recognized `payload.key`.
    pub fn notification(key: &str, company_id: Option<&str>, message: impl Into<String>) -> Self {
        let mut ev = Self::new(EventType::Notification, "analysis");
        ev.company_id = company_id.map(str::to_string);
        ev.message = Some(message.into());
        ev.payload = Some(serde_json::json!({ "key": key }));
        ev
    }

    pub fn with_direction(mut self, direction: &str) -> Self {
        self.direction = Some(direction.to_string());
        self
    }

    pub fn with_request_id(mut self, request_id: &str) -> Self {
        self.request_id = Some(request_id.to_string());
        self
    }

    pub fn with_company(mut self, company_id: &str) -> Self {
        self.company_id = Some(company_id.to_string());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Merge `fields` into the payload object, keeping an existing `key`.
    pub fn with_payload(mut self, fields: serde_json::Value) -> Self {
        match (&mut self.payload, fields) {
            (Some(serde_json::Value::Object(existing)), serde_json::Value::Object(extra)) => {
                existing.extend(extra);
            }
            (slot, fields) => *slot = Some(fields),
        }
        self
    }

    pub fn key(&self) -> Option<&str> {
        self.payload
            .as_ref()
            .and_then(|p| p.get("key"))
            .and_then(|k| k.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub id: i64,
    pub created_at: String,
    pub event_type: EventType,
    pub source: String,
    pub direction: Option<String>,
    pub request_id: Option<String>,
    pub company_id: Option<String>,
    pub company_name: Option<String>,
    pub message: Option<String>,
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    #[default]
    All,
    Traffic,
    Error,
    Notification,
}

impl EventCategory {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "" | "all" => Some(EventCategory::All),
            "traffic" => Some(EventCategory::Traffic),
            "error" | "errors" => Some(EventCategory::Error),
            "notification" | "notifications" => Some(EventCategory::Notification),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub category: EventCategory,
    pub query: Option<String>,
    pub company_id: Option<String>,
    pub source: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPage {
    pub items: Vec<EventRecord>,
    pub total: i64,
    pub page: usize,
    pub page_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyRecord {
    pub inn: String,
    #[serde(default)]
    pub short_name: Option<String>,
    #[serde(default)]
    pub okved: Option<String>,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyFilter {
    #[serde(default, alias = "q")]
    pub query: Option<String>,
    #[serde(default)]
    pub okved: Option<String>,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyFlags {
    pub inn: String,
    pub analysis_ok: bool,
    pub server_error: bool,
    pub no_valid_site: bool,
    pub analysis_started_at: Option<String>,
    pub analysis_status: Option<String>,
}

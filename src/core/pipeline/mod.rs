//! External AI analysis pipeline: step registry, HTTP client and step runner.

pub mod client;
#[cfg(test)]
pub mod mock;
pub mod registry;
pub mod runner;

pub use client::IntegrationClient;
pub use registry::{FULL_PIPELINE, StepAttempt, StepDefinition, step_definition};
pub use runner::StepRunner;

use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisMode {
    /// One call to the service's whole-pipeline endpoint.
    Full,
    /// The discrete steps, one at a time.
    #[default]
    Steps,
}

impl AnalysisMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisMode::Full => "full",
            AnalysisMode::Steps => "steps",
        }
    }
}

impl FromStr for AnalysisMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "full" => Ok(AnalysisMode::Full),
            "steps" => Ok(AnalysisMode::Steps),
            other => Err(format!("unknown analysis mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKey {
    Lookup,
    ParseSite,
    AnalyzeJson,
    IbMatch,
    EquipmentSelection,
}

impl StepKey {
    /// Canonical order of the steps pipeline.
    pub const ALL: [StepKey; 5] = [
        StepKey::Lookup,
        StepKey::ParseSite,
        StepKey::AnalyzeJson,
        StepKey::IbMatch,
        StepKey::EquipmentSelection,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StepKey::Lookup => "lookup",
            StepKey::ParseSite => "parse_site",
            StepKey::AnalyzeJson => "analyze_json",
            StepKey::IbMatch => "ib_match",
            StepKey::EquipmentSelection => "equipment_selection",
        }
    }
}

impl FromStr for StepKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        StepKey::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| format!("unknown analysis step '{}'", s.trim()))
    }
}

impl std::fmt::Display for StepKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one step (or of the whole-pipeline call) after all rounds.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub ok: bool,
    pub status: u16,
    pub error: Option<String>,
    /// Last JSON body seen, success or failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

impl StepResult {
    pub fn success(status: u16, body: Option<serde_json::Value>) -> Self {
        Self {
            ok: true,
            status,
            error: None,
            body,
        }
    }

    pub fn failure(status: u16, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            status,
            error: Some(error.into()),
            body: None,
        }
    }

    pub fn timed_out(after: std::time::Duration) -> Self {
        Self::failure(504, format!("timed out after {} ms", after.as_millis()))
    }

    /// Whether the service reported that the company has no usable website.
    pub fn reports_no_valid_site(&self) -> bool {
        let Some(body) = &self.body else {
            return false;
        };
        body.get("no_valid_site").and_then(|v| v.as_bool()) == Some(true)
            || body.get("error").and_then(|v| v.as_str()) == Some("no_valid_site")
            || body
                .get("detail")
                .and_then(|d| d.get("no_valid_site"))
                .and_then(|v| v.as_bool())
                == Some(true)
    }
}

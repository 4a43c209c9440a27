use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::core::pipeline::{AnalysisMode, StepKey};

/// Process-wide configuration. Loaded once at startup and shared read-only.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub log_level: String,

    /// Base URL of the external AI analysis service. Unset means enqueue is refused.
    pub integration_base_url: Option<String>,
    pub force_mode: Option<AnalysisMode>,
    pub force_steps: Option<Vec<StepKey>>,
    pub use_lock: bool,

    pub step_timeout_ms: u64,
    pub job_timeout_ms: u64,
    pub health_timeout_ms: u64,
    pub step_attempts: u32,
    pub health_retry_delay_ms: u64,
    pub retry_delay_ms: u64,
    pub max_defers: u32,
    pub lock_lease_secs: u64,
    pub sweep_cron: Option<String>,

    pub admin_token: Option<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            db_path: PathBuf::from("data/analysis.db"),
            log_level: "info".to_string(),
            integration_base_url: None,
            force_mode: None,
            force_steps: None,
            use_lock: true,
            step_timeout_ms: 30_000,
            job_timeout_ms: 60_000,
            health_timeout_ms: 5_000,
            step_attempts: 5,
            health_retry_delay_ms: 2_000,
            retry_delay_ms: 2_000,
            max_defers: 3,
            lock_lease_secs: 600,
            sweep_cron: Some("0 */1 * * * *".to_string()),
            admin_token: None,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a comma separated step list. Unknown names are skipped with a warning.
pub fn parse_step_list(value: &str) -> Vec<StepKey> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse::<StepKey>() {
            Ok(step) => Some(step),
            Err(_) => {
                warn!("Ignoring unknown analysis step '{}'", s);
                None
            }
        })
        .collect()
}

impl AnalysisConfig {
    /// Read the TOML file if present, then apply environment overrides.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let content = tokio::fs::read_to_string(p).await?;
                let cfg: AnalysisConfig = toml::from_str(&content)
                    .with_context(|| format!("invalid config file {}", p.display()))?;
                info!("Loaded config from {}", p.display());
                cfg
            }
            Some(p) => {
                info!("No config at {}, using defaults", p.display());
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// The lease is only renewed between jobs, so it has to outlive the
    /// longest job.
    pub fn validate(&self) -> Result<()> {
        if self.use_lock && self.lock_lease() <= self.job_timeout() {
            bail!(
                "lock_lease_secs ({}s) must be longer than job_timeout_ms ({}ms)",
                self.lock_lease_secs,
                self.job_timeout_ms
            );
        }
        Ok(())
    }

    /// Apply environment-style overrides from `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(base) = lookup("AI_INTEGRATION_BASE") {
            let base = base.trim().to_string();
            self.integration_base_url = (!base.is_empty()).then_some(base);
        }
        if let Some(mode) = lookup("AI_ANALYZE_MODE") {
            match mode.parse::<AnalysisMode>() {
                Ok(m) => self.force_mode = Some(m),
                Err(_) if mode.trim().is_empty() => self.force_mode = None,
                Err(_) => warn!("Ignoring invalid AI_ANALYZE_MODE '{}'", mode),
            }
        }
        if let Some(flag) = lookup("AI_ANALYZE_LOCK")
            && let Some(v) = parse_bool(&flag)
        {
            self.use_lock = v;
        }
        if let Some(steps) = lookup("AI_ANALYZE_STEPS") {
            let parsed = parse_step_list(&steps);
            self.force_steps = (!parsed.is_empty()).then_some(parsed);
        }
        if let Some(ms) = lookup("AI_ANALYZE_STEP_TIMEOUT_MS").and_then(|v| v.trim().parse().ok()) {
            self.step_timeout_ms = ms;
        }
        if let Some(ms) = lookup("AI_ANALYZE_TIMEOUT_MS").and_then(|v| v.trim().parse().ok()) {
            self.job_timeout_ms = ms;
        }
        if let Some(token) = lookup("ANALYSIS_ADMIN_TOKEN") {
            let token = token.trim().to_string();
            self.admin_token = (!token.is_empty()).then_some(token);
        }
        if let Some(path) = lookup("ANALYSIS_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
    }

    /// Normalized integration base (no trailing slash), if configured.
    pub fn integration_base(&self) -> Option<String> {
        self.integration_base_url
            .as_deref()
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn health_retry_delay(&self) -> Duration {
        Duration::from_millis(self.health_retry_delay_ms)
    }

    /// Delay after a failed round `n` (1-based) of a step.
    pub fn retry_delay(&self, round: u32) -> Duration {
        Duration::from_millis(self.retry_delay_ms.saturating_mul(round as u64))
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_secs)
    }
}

//! Configuration management for the E2E runner
//!
//! Supports configuration via:
//! - Environment variables (primary)
//! - Optional TOML config file (secondary)
//!
//! Environment variables take precedence over config file values. The
//! resulting [`Config`] is built once at startup and passed by reference.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::{E2eError, Result};
use crate::scenario::{default_scenarios, ScenarioConfig};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines
    Text,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("Unknown log format: {}", s)),
        }
    }
}

/// Main configuration structure
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Management API base URL (default: http://localhost:8080)
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Value sent as `X-Api-Token` on every request
    #[serde(default = "default_api_token")]
    pub api_token: String,

    /// Turn skipped GCS policy steps into failures
    #[serde(default)]
    pub gcs_strict: bool,

    /// Per-request HTTP timeout in seconds (default: 30)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Readiness deadline in seconds (default: 120)
    #[serde(default = "default_readiness_timeout_secs")]
    pub readiness_timeout_secs: u64,

    /// Job completion deadline in seconds (default: 180)
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    /// Delay between readiness and job polls in milliseconds (default: 1000)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Log level (default: info)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format (default: text)
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    /// Where to write Prometheus text metrics at exit
    #[serde(default)]
    pub metrics_file: Option<PathBuf>,

    /// Provider scenarios, run in order
    #[serde(default = "default_scenarios")]
    pub scenarios: Vec<ScenarioConfig>,
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_api_token() -> String {
    "change-me".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_readiness_timeout_secs() -> u64 {
    120
}

fn default_job_timeout_secs() -> u64 {
    180
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

/// Accepted truthy spellings for boolean toggles
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "y"
    )
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - E2E_CONFIG_FILE: optional path to TOML config file
    /// - BASE_URL: management API base URL
    /// - API_TOKEN: API token
    /// - E2E_GCS_IAM: strict mode for the GCS policy scenario (1/true/yes/y)
    /// - E2E_REQUEST_TIMEOUT_SECS: per-request timeout (default: 30)
    /// - E2E_READINESS_TIMEOUT_SECS: readiness deadline (default: 120)
    /// - E2E_JOB_TIMEOUT_SECS: job deadline (default: 180)
    /// - E2E_POLL_INTERVAL_MS: poll interval (default: 1000)
    /// - E2E_LOG_LEVEL: log level (default: info)
    /// - E2E_LOG_FORMAT: text|json (default: text)
    /// - E2E_METRICS_FILE: optional metrics output path
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Config::from_env`] with an explicit variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup("E2E_CONFIG_FILE") {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };

        if let Some(base_url) = lookup("BASE_URL") {
            config.base_url = base_url;
        }

        if let Some(token) = lookup("API_TOKEN") {
            config.api_token = token;
        }

        if let Some(strict) = lookup("E2E_GCS_IAM") {
            config.gcs_strict = is_truthy(&strict);
        }

        if let Some(v) = lookup("E2E_REQUEST_TIMEOUT_SECS") {
            config.request_timeout_secs = parse_number("E2E_REQUEST_TIMEOUT_SECS", &v)?;
        }

        if let Some(v) = lookup("E2E_READINESS_TIMEOUT_SECS") {
            config.readiness_timeout_secs = parse_number("E2E_READINESS_TIMEOUT_SECS", &v)?;
        }

        if let Some(v) = lookup("E2E_JOB_TIMEOUT_SECS") {
            config.job_timeout_secs = parse_number("E2E_JOB_TIMEOUT_SECS", &v)?;
        }

        if let Some(v) = lookup("E2E_POLL_INTERVAL_MS") {
            config.poll_interval_ms = parse_number("E2E_POLL_INTERVAL_MS", &v)?;
        }

        if let Some(level) = lookup("E2E_LOG_LEVEL") {
            config.log_level = level;
        }

        if let Some(format) = lookup("E2E_LOG_FORMAT") {
            config.log_format = LogFormat::from_str(&format).map_err(E2eError::Config)?;
        }

        if let Some(path) = lookup("E2E_METRICS_FILE") {
            config.metrics_file = Some(PathBuf::from(path));
        }

        config.base_url = config.base_url.trim_end_matches('/').to_string();
        if config.scenarios.is_empty() {
            return Err(E2eError::Config("no scenarios configured".to_string()));
        }
        Ok(config)
    }

    /// Load configuration from TOML file
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| E2eError::Config(format!("invalid config file {}: {}", path, e)))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_token: default_api_token(),
            gcs_strict: false,
            request_timeout_secs: default_request_timeout_secs(),
            readiness_timeout_secs: default_readiness_timeout_secs(),
            job_timeout_secs: default_job_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_file: None,
            scenarios: default_scenarios(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scenarios: Vec<&str> = self.scenarios.iter().map(|s| s.name.as_str()).collect();
        f.debug_struct("Config")
            .field("base_url", &self.base_url)
            .field("api_token", &"<redacted>")
            .field("gcs_strict", &self.gcs_strict)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("readiness_timeout_secs", &self.readiness_timeout_secs)
            .field("job_timeout_secs", &self.job_timeout_secs)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("log_level", &self.log_level)
            .field("log_format", &self.log_format)
            .field("metrics_file", &self.metrics_file)
            .field("scenarios", &scenarios)
            .finish()
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|e| E2eError::Config(format!("{} must be a non-negative integer: {}", key, e)))
}

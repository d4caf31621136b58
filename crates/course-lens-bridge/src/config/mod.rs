//! Configuration loading and resolution.
//!
//! Every setting resolves from an explicit value, then its environment
//! variable, then a built-in default.

use std::time::Duration;

use url::Url;

use crate::types::{BridgeError, BridgeResult};

pub const DEFAULT_METRICS_URL: &str = "http://localhost:8080";
pub const DEFAULT_COMPLETION_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

pub const METRICS_URL_ENV: &str = "COURSE_LENS_METRICS_URL";
pub const COMPLETION_URL_ENV: &str = "COURSE_LENS_COMPLETION_URL";
pub const API_KEY_ENV: &str = "COURSE_LENS_API_KEY";
pub const MODEL_ENV: &str = "COURSE_LENS_MODEL";
pub const TIMEOUT_ENV: &str = "COURSE_LENS_TIMEOUT_SECS";

/// Values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct BridgeOverrides {
    pub metrics_url: Option<String>,
    pub completion_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Metrics and explanation-cache service.
    pub metrics_url: Url,
    /// OpenAI-compatible completion API.
    pub completion_url: Url,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
}

impl BridgeConfig {
    pub fn resolve(overrides: BridgeOverrides) -> BridgeResult<Self> {
        let metrics_url = resolve_setting(overrides.metrics_url, METRICS_URL_ENV)
            .unwrap_or_else(|| DEFAULT_METRICS_URL.to_string());
        let completion_url = resolve_setting(overrides.completion_url, COMPLETION_URL_ENV)
            .unwrap_or_else(|| DEFAULT_COMPLETION_URL.to_string());
        let model = resolve_setting(overrides.model, MODEL_ENV)
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let timeout_secs = match overrides.timeout_secs {
            Some(secs) => secs,
            None => match std::env::var(TIMEOUT_ENV) {
                Ok(raw) => raw
                    .trim()
                    .parse()
                    .map_err(|_| BridgeError::Config(format!("{TIMEOUT_ENV}={raw} is not a number")))?,
                Err(_) => DEFAULT_TIMEOUT_SECS,
            },
        };

        Ok(Self {
            metrics_url: parse_base(&metrics_url)?,
            completion_url: parse_base(&completion_url)?,
            api_key: resolve_setting(overrides.api_key, API_KEY_ENV),
            model,
            timeout: Duration::from_secs(timeout_secs),
        })
    }

    /// Config pointing at explicit service URLs, ignoring the environment.
    pub fn with_urls(metrics_url: &str, completion_url: &str) -> BridgeResult<Self> {
        Ok(Self {
            metrics_url: parse_base(metrics_url)?,
            completion_url: parse_base(completion_url)?,
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        })
    }
}

fn resolve_setting(explicit: Option<String>, var: &str) -> Option<String> {
    explicit
        .or_else(|| std::env::var(var).ok())
        .filter(|value| !value.trim().is_empty())
}

fn parse_base(raw: &str) -> BridgeResult<Url> {
    let url = Url::parse(raw.trim())?;
    if url.cannot_be_a_base() {
        return Err(BridgeError::Config(format!("{raw} cannot be used as a base URL")));
    }
    Ok(url)
}

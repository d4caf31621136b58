//! Client for the metrics and explanation-cache service.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use url::Url;

use course_lens::messages::{ExplanationResponse, Metrics};

use crate::types::{BridgeError, BridgeResult};

#[derive(Debug, Deserialize)]
struct HealthBody {
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct MetricsBody {
    #[serde(default)]
    metrics: Option<Metrics>,
}

/// A formatted explanation stored for reuse across sessions.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecord<'a> {
    pub key: &'a str,
    pub data: &'a ExplanationResponse,
    pub query: &'a str,
    pub product_id: &'a str,
    pub title: &'a str,
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
}

impl ApiClient {
    pub fn new(http: reqwest::Client, base: Url) -> Self {
        Self { http, base }
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Append path segments to the base URL, percent-encoding each one.
    pub fn endpoint(&self, segments: &[&str]) -> BridgeResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| BridgeError::Config(format!("{} cannot be a base URL", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// True when the service reports itself healthy.
    pub async fn health(&self) -> BridgeResult<bool> {
        let url = self.endpoint(&["health"])?;
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(BridgeError::status(response.status()));
        }
        let body: HealthBody = response.json().await?;
        Ok(body.status == "healthy")
    }

    /// Metrics for an already-normalized query and bare product id.
    /// `None` when the service has no record of the pair.
    pub async fn metrics(&self, query: &str, product_id: &str) -> BridgeResult<Option<Metrics>> {
        let url = self.endpoint(&["metrics", query, product_id])?;
        tracing::debug!(%url, "Fetching metrics");
        let response = self.http.get(url).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body: MetricsBody = response.json().await?;
                Ok(body.metrics)
            }
            status => Err(BridgeError::status(status)),
        }
    }

    pub async fn cached_explanation(&self, key: &str) -> BridgeResult<Option<ExplanationResponse>> {
        let url = self.endpoint(&["ai-explanation", key])?;
        let response = self.http.get(url).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            status => Err(BridgeError::status(status)),
        }
    }

    pub async fn store_explanation(&self, record: &CacheRecord<'_>) -> BridgeResult<()> {
        let url = self.endpoint(&["ai-explanation"])?;
        let response = self.http.post(url).json(record).send().await?;
        if !response.status().is_success() {
            return Err(BridgeError::status(response.status()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> ApiClient {
        ApiClient::new(reqwest::Client::new(), Url::parse(base).unwrap())
    }

    #[test]
    fn test_endpoint_encodes_segments() {
        let api = client("http://localhost:8080");
        let url = api.endpoint(&["metrics", "machine learning", "XYZ"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/metrics/machine%20learning/XYZ");

        let url = api.endpoint(&["metrics", "c/c++", "a?b"]).unwrap();
        assert_eq!(url.path(), "/metrics/c%2Fc++/a%3Fb");
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let api = client("http://gateway.local/lens/");
        let url = api.endpoint(&["health"]).unwrap();
        assert_eq!(url.as_str(), "http://gateway.local/lens/health");
    }
}

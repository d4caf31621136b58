//! HTTP-backed implementation of the page's background collaborator.

use async_trait::async_trait;

use course_lens::messages::{
    normalize_query, strip_product_id, ExplanationRequest, ExplanationResponse, HealthResponse,
    MetricsResponse, ProductDetails,
};
use course_lens::{Bridge, LensResult};

use crate::config::BridgeConfig;
use crate::services::{ApiClient, CompletionClient, ExplanationService};
use crate::types::BridgeResult;

/// Answers page requests from the metrics service and the completion API.
///
/// Service failures become `success: false` replies or the fixed explanation
/// failure; they never surface as errors to the page.
pub struct HttpBridge {
    api: ApiClient,
    explanations: ExplanationService,
}

impl HttpBridge {
    pub fn new(api: ApiClient, completion: CompletionClient) -> Self {
        Self {
            explanations: ExplanationService::new(api.clone(), completion),
            api,
        }
    }

    pub fn from_config(config: &BridgeConfig) -> BridgeResult<Self> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        let api = ApiClient::new(http.clone(), config.metrics_url.clone());
        let completion = CompletionClient::new(
            http,
            config.completion_url.clone(),
            config.api_key.clone(),
            config.model.clone(),
        );
        Ok(Self::new(api, completion))
    }

    pub fn explanations(&self) -> &ExplanationService {
        &self.explanations
    }
}

#[async_trait]
impl Bridge for HttpBridge {
    async fn check_health(&self) -> LensResult<HealthResponse> {
        Ok(match self.api.health().await {
            Ok(healthy) => HealthResponse {
                success: true,
                healthy,
                error: None,
            },
            Err(e) => {
                tracing::warn!(base = %self.api.base(), "Health check failed: {e}");
                HealthResponse::failure(e.to_string())
            }
        })
    }

    async fn fetch_metrics(&self, query: &str, product_id: &str) -> LensResult<MetricsResponse> {
        let normalized = normalize_query(query);
        let bare_id = strip_product_id(product_id);
        Ok(match self.api.metrics(&normalized, bare_id).await {
            Ok(metrics) => MetricsResponse {
                success: true,
                metrics,
                original_query: query.to_string(),
                normalized_query: normalized,
                error: None,
            },
            Err(e) => {
                tracing::warn!(query = %normalized, product_id = %bare_id, "Metrics lookup failed: {e}");
                MetricsResponse::failure(e.to_string())
            }
        })
    }

    async fn format_explanation(
        &self,
        explanation: ExplanationRequest,
        product_details: ProductDetails,
        search_query: &str,
    ) -> LensResult<ExplanationResponse> {
        Ok(
            match self
                .explanations
                .format(explanation, &product_details, search_query)
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(product_id = %product_details.product_id, "Explanation failed: {e}");
                    ExplanationResponse::failure()
                }
            },
        )
    }
}

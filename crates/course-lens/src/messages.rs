//! Message contract between the page side and the background bridge.
//!
//! Requests are tagged by `action`; responses are plain camelCase objects.
//! Both crates share these types so the wire format cannot drift.

use std::fmt;

use async_trait::async_trait;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::types::{LensResult, Match};

/// Sentinel sent instead of a raw explanation when only metadata is available.
pub const FALLBACK_MODE: &str = "FALLBACK_MODE";

/// Lowercase a query for metrics and cache lookups.
pub fn normalize_query(query: &str) -> String {
    query.to_lowercase()
}

/// The segment after the first `~` of a product id, or the whole id when it
/// has none. Anything after a second `~` is dropped.
pub fn strip_product_id(product_id: &str) -> &str {
    product_id.split('~').nth(1).unwrap_or(product_id)
}

/// Key of a formatted explanation in the session and remote caches.
pub fn cache_key(query: &str, product_id: &str) -> String {
    format!("{}:{}", normalize_query(query), product_id)
}

/// The explanation handed to the formatter.
#[derive(Debug, Clone, PartialEq)]
pub enum ExplanationRequest {
    /// The raw relevance payload from the search response.
    Raw(Value),
    /// The payload field was present but empty; format from metadata only.
    FallbackMode,
}

impl ExplanationRequest {
    pub fn is_fallback(&self) -> bool {
        matches!(self, ExplanationRequest::FallbackMode)
    }
}

impl Serialize for ExplanationRequest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ExplanationRequest::Raw(value) => value.serialize(serializer),
            ExplanationRequest::FallbackMode => serializer.serialize_str(FALLBACK_MODE),
        }
    }
}

impl<'de> Deserialize<'de> for ExplanationRequest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(match value {
            Value::String(s) if s == FALLBACK_MODE => ExplanationRequest::FallbackMode,
            other => ExplanationRequest::Raw(other),
        })
    }
}

/// Product context sent along with an explanation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductDetails {
    pub product_id: String,
    pub title: String,
    pub partner: String,
    pub description: String,
    #[serde(default)]
    pub skills: Vec<String>,
    pub average_rating: String,
    #[serde(default)]
    pub num_ratings: u64,
    #[serde(default)]
    pub is_course_free: bool,
    pub url: String,
    pub entity_type: String,
    #[serde(default)]
    pub partners: Vec<String>,
    #[serde(default)]
    pub raw_card_info: Value,
    #[serde(default)]
    pub raw_response_data: Value,
}

impl ProductDetails {
    /// Build the formatter context from a correlated match.
    pub fn from_match(m: &Match) -> Self {
        let card = &m.card;
        let result = m.result.as_ref();
        Self {
            product_id: card.product_id().to_string(),
            title: card.display.title.clone(),
            partner: card.display.partner.clone(),
            description: result
                .map(|r| r.description.clone())
                .unwrap_or_else(|| "No description available".to_string()),
            skills: result.map(|r| r.skills.clone()).unwrap_or_default(),
            average_rating: result
                .and_then(|r| r.rating.score())
                .map(|s| s.to_string())
                .unwrap_or_else(|| card.display.rating.clone()),
            num_ratings: result.map(|r| r.rating_count).unwrap_or(0),
            is_course_free: result.is_some_and(|r| r.is_free),
            url: result
                .map(|r| r.url.clone())
                .unwrap_or_else(|| "No URL".to_string()),
            entity_type: result
                .map(|r| r.entity_type.clone())
                .unwrap_or_else(|| "Unknown".to_string()),
            partners: result.map(|r| r.partners.clone()).unwrap_or_default(),
            raw_card_info: serde_json::to_value(&card.display).unwrap_or(Value::Null),
            raw_response_data: result.map(|r| r.raw.clone()).unwrap_or(Value::Null),
        }
    }
}

/// A request from the page side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum BridgeRequest {
    CheckHealthService,
    FetchMetrics {
        query: String,
        #[serde(rename = "productId")]
        product_id: String,
    },
    FormatExplanation {
        explanation: ExplanationRequest,
        #[serde(rename = "productDetails")]
        product_details: ProductDetails,
        #[serde(rename = "searchQuery")]
        search_query: String,
    },
}

impl BridgeRequest {
    pub fn action(&self) -> &'static str {
        match self {
            BridgeRequest::CheckHealthService => "checkHealthService",
            BridgeRequest::FetchMetrics { .. } => "fetchMetrics",
            BridgeRequest::FormatExplanation { .. } => "formatExplanation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub success: bool,
    #[serde(default)]
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthResponse {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            healthy: false,
            error: Some(error.into()),
        }
    }
}

/// Historical performance of a product for a query. Rates are percentages.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub viewers: Option<f64>,
    pub clickers: Option<f64>,
    pub enrollers: Option<f64>,
    pub paid_enrollers: Option<f64>,
    pub ctr: Option<f64>,
    pub enrollment_rate: Option<f64>,
    pub paid_conversion_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsResponse {
    pub success: bool,
    #[serde(default)]
    pub metrics: Option<Metrics>,
    #[serde(default)]
    pub original_query: String,
    #[serde(default)]
    pub normalized_query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MetricsResponse {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Where a formatted explanation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    Session,
    Redis,
    Fresh,
}

/// Labelled explanation sections in generation order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Sections(pub Vec<(String, String)>);

impl Sections {
    pub fn get(&self, label: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, text)| text.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(l, t)| (l.as_str(), t.as_str()))
    }
}

impl Serialize for Sections {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter().map(|(l, t)| (l, t)))
    }
}

impl<'de> Deserialize<'de> for Sections {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SectionsVisitor;

        impl<'de> Visitor<'de> for SectionsVisitor {
            type Value = Sections;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of section labels to text")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Sections, A::Error> {
                let mut entries = Vec::new();
                while let Some((label, text)) = map.next_entry::<String, String>()? {
                    entries.push((label, text));
                }
                Ok(Sections(entries))
            }
        }

        deserializer.deserialize_map(SectionsVisitor)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplanationResponse {
    pub sections: Sections,
    pub cached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_type: Option<CacheType>,
    #[serde(default)]
    pub fallback_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,
}

impl ExplanationResponse {
    /// The fixed response returned when formatting fails.
    pub fn failure() -> Self {
        Self {
            sections: Sections(vec![(
                "❌ Error".to_string(),
                "Failed to generate AI explanation. Please try again later.".to_string(),
            )]),
            cached: false,
            cache_type: None,
            fallback_mode: false,
            raw_response: None,
            query: None,
            product_id: None,
            error: true,
        }
    }

    /// Same content, marked as served from a cache.
    pub fn from_cache(mut self, cache_type: CacheType) -> Self {
        self.cached = true;
        self.cache_type = Some(cache_type);
        self
    }
}

/// Any response the bridge can send back.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BridgeReply {
    Health(HealthResponse),
    Metrics(MetricsResponse),
    Explanation(ExplanationResponse),
}

/// The privileged background collaborator.
///
/// Implementations turn service failures into `success: false` / `error`
/// responses; an `Err` means the message channel itself failed.
#[async_trait]
pub trait Bridge: Send + Sync {
    async fn check_health(&self) -> LensResult<HealthResponse>;

    async fn fetch_metrics(&self, query: &str, product_id: &str) -> LensResult<MetricsResponse>;

    async fn format_explanation(
        &self,
        explanation: ExplanationRequest,
        product_details: ProductDetails,
        search_query: &str,
    ) -> LensResult<ExplanationResponse>;

    /// Route a tagged request to the matching operation.
    async fn handle(&self, request: BridgeRequest) -> LensResult<BridgeReply> {
        Ok(match request {
            BridgeRequest::CheckHealthService => BridgeReply::Health(self.check_health().await?),
            BridgeRequest::FetchMetrics { query, product_id } => {
                BridgeReply::Metrics(self.fetch_metrics(&query, &product_id).await?)
            }
            BridgeRequest::FormatExplanation {
                explanation,
                product_details,
                search_query,
            } => BridgeReply::Explanation(
                self.format_explanation(explanation, product_details, &search_query)
                    .await?,
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalization_helpers() {
        assert_eq!(normalize_query("Machine Learning"), "machine learning");
        assert_eq!(strip_product_id("course~XYZ"), "XYZ");
        assert_eq!(strip_product_id("plain"), "plain");
        assert_eq!(strip_product_id("s12n~abc~v2"), "abc");
        assert_eq!(strip_product_id("course~"), "");
        assert_eq!(cache_key("Data Science", "course~1"), "data science:course~1");
    }

    #[test]
    fn test_request_wire_format() {
        let request: BridgeRequest = serde_json::from_value(json!({
            "action": "fetchMetrics",
            "query": "Python",
            "productId": "course~abc"
        }))
        .unwrap();
        assert_eq!(
            request,
            BridgeRequest::FetchMetrics {
                query: "Python".to_string(),
                product_id: "course~abc".to_string()
            }
        );

        let health = serde_json::to_value(BridgeRequest::CheckHealthService).unwrap();
        assert_eq!(health, json!({"action": "checkHealthService"}));
    }

    #[test]
    fn test_explanation_sentinel() {
        let fallback: ExplanationRequest = serde_json::from_value(json!("FALLBACK_MODE")).unwrap();
        assert!(fallback.is_fallback());

        let raw: ExplanationRequest = serde_json::from_value(json!({"score": 0.9})).unwrap();
        assert_eq!(raw, ExplanationRequest::Raw(json!({"score": 0.9})));
        assert_eq!(
            serde_json::to_value(ExplanationRequest::FallbackMode).unwrap(),
            json!("FALLBACK_MODE")
        );
    }

    #[test]
    fn test_sections_keep_order() {
        let response: ExplanationResponse = serde_json::from_str(
            r#"{"sections":{"💫 Recommendation":"z","📋 Summary":"a"},"cached":false,"cacheType":"fresh"}"#,
        )
        .unwrap();
        let labels: Vec<&str> = response.sections.iter().map(|(l, _)| l).collect();
        assert_eq!(labels, vec!["💫 Recommendation", "📋 Summary"]);
        assert_eq!(response.cache_type, Some(CacheType::Fresh));

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.find("💫").unwrap() < json.find("📋").unwrap());
        assert!(!json.contains("\"error\""));
    }

    #[test]
    fn test_failure_shape() {
        let failure = serde_json::to_value(ExplanationResponse::failure()).unwrap();
        assert_eq!(failure["error"], true);
        assert_eq!(failure["cached"], false);
        assert!(failure["sections"]["❌ Error"].is_string());

        let metrics = serde_json::to_value(MetricsResponse::failure("HTTP 500")).unwrap();
        assert_eq!(metrics["success"], false);
        assert_eq!(metrics["error"], "HTTP 500");
    }
}

//! Integration tests for the HTTP-backed bridge against mock services.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::BufReader;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use course_lens::messages::{CacheType, ExplanationRequest, ProductDetails};
use course_lens::Bridge;
use course_lens_bridge::services::{ApiClient, CompletionClient};
use course_lens_bridge::{HttpBridge, ProtocolHandler, StdioTransport};

// ─────────────────────── helpers ───────────────────────

const REPLY: &str = "📋 Summary: Regression and testing.\n\
🎯 Relevance: Central to the query.\n\
💫 Recommendation: Analysts moving into modelling.";

fn bridge_for(metrics: &MockServer, completion: &MockServer) -> HttpBridge {
    let http = reqwest::Client::new();
    let api = ApiClient::new(http.clone(), metrics.uri().parse().unwrap());
    let completion = CompletionClient::new(
        http,
        completion.uri().parse().unwrap(),
        Some("sk-test".to_string()),
        "test-model".to_string(),
    );
    HttpBridge::new(api, completion)
}

fn details() -> ProductDetails {
    ProductDetails {
        product_id: "course~stats".to_string(),
        title: "Applied Statistics".to_string(),
        partner: "Example University".to_string(),
        description: "Hypothesis testing.".to_string(),
        skills: vec!["Statistics".to_string()],
        average_rating: "4.8".to_string(),
        num_ratings: 10,
        is_course_free: true,
        url: "https://www.example.org/learn/stats".to_string(),
        entity_type: "COURSE".to_string(),
        partners: Vec::new(),
        raw_card_info: Value::Null,
        raw_response_data: Value::Null,
    }
}

fn completion_body(content: &str) -> Value {
    json!({"choices": [{"message": {"role": "assistant", "content": content}}]})
}

async fn mount_empty_remote_cache(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/ai-explanation/data%20science:course~stats"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "missing"})))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/ai-explanation"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
        .mount(server)
        .await;
}

// ─────────────────────── health and metrics ───────────────────────

#[tokio::test]
async fn test_health_reports_service_state() {
    let metrics = MockServer::start().await;
    let completion = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "healthy",
            "redis_connected": true,
            "total_keys": 42
        })))
        .mount(&metrics)
        .await;

    let health = bridge_for(&metrics, &completion).check_health().await.unwrap();
    assert!(health.success);
    assert!(health.healthy);
}

#[tokio::test]
async fn test_health_failure_shape() {
    let metrics = MockServer::start().await;
    let completion = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&metrics)
        .await;

    let health = bridge_for(&metrics, &completion).check_health().await.unwrap();
    assert!(!health.success);
    assert_eq!(health.error.as_deref(), Some("HTTP 503: Service Unavailable"));
}

#[tokio::test]
async fn test_metrics_lookup_normalizes_query_and_id() {
    let metrics = MockServer::start().await;
    let completion = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/metrics/machine%20learning/XYZ"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "query": "machine learning",
            "product_id": "XYZ",
            "metrics": {
                "viewers": 1200.0,
                "clickers": 300.0,
                "enrollers": 45.0,
                "paid_enrollers": 9.0,
                "ctr": 25.0,
                "enrollment_rate": 15.0,
                "paid_conversion_rate": 20.0
            }
        })))
        .expect(1)
        .mount(&metrics)
        .await;

    let response = bridge_for(&metrics, &completion)
        .fetch_metrics("Machine Learning", "course~XYZ")
        .await
        .unwrap();
    assert!(response.success);
    assert_eq!(response.original_query, "Machine Learning");
    assert_eq!(response.normalized_query, "machine learning");
    let m = response.metrics.unwrap();
    assert_eq!(m.viewers, Some(1200.0));
    assert_eq!(m.paid_conversion_rate, Some(20.0));
}

#[tokio::test]
async fn test_metrics_not_found_is_success_without_data() {
    let metrics = MockServer::start().await;
    let completion = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/metrics/rust/abc"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&metrics)
        .await;

    let response = bridge_for(&metrics, &completion)
        .fetch_metrics("Rust", "abc")
        .await
        .unwrap();
    assert!(response.success);
    assert!(response.metrics.is_none());
    assert!(response.error.is_none());
}

#[tokio::test]
async fn test_metrics_server_error() {
    let metrics = MockServer::start().await;
    let completion = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/metrics/rust/abc"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&metrics)
        .await;

    let response = bridge_for(&metrics, &completion)
        .fetch_metrics("rust", "abc")
        .await
        .unwrap();
    assert!(!response.success);
    assert_eq!(response.error.as_deref(), Some("HTTP 500: Internal Server Error"));
}

// ─────────────────────── explanations ───────────────────────

#[tokio::test]
async fn test_fresh_explanation_then_session_cache() {
    let metrics = MockServer::start().await;
    let completion = MockServer::start().await;
    mount_empty_remote_cache(&metrics).await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({"model": "test-model", "max_tokens": 800})))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(REPLY)))
        .expect(1)
        .mount(&completion)
        .await;

    let bridge = bridge_for(&metrics, &completion);
    let first = bridge
        .format_explanation(ExplanationRequest::FallbackMode, details(), "Data Science")
        .await
        .unwrap();
    assert!(!first.cached);
    assert_eq!(first.cache_type, Some(CacheType::Fresh));
    assert!(first.fallback_mode);
    assert_eq!(first.sections.len(), 3);
    assert_eq!(first.sections.get("🎯 Relevance"), Some("Central to the query."));
    assert_eq!(first.product_id.as_deref(), Some("course~stats"));

    let second = bridge
        .format_explanation(ExplanationRequest::FallbackMode, details(), "data science")
        .await
        .unwrap();
    assert!(second.cached);
    assert_eq!(second.cache_type, Some(CacheType::Session));
    assert_eq!(second.sections, first.sections);
    assert_eq!(bridge.explanations().session_len().await, 1);

    let stored: Vec<Value> = metrics
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.method.as_str() == "POST")
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0]["key"], "data science:course~stats");
    assert_eq!(stored[0]["productId"], "course~stats");
    assert_eq!(stored[0]["title"], "Applied Statistics");
    assert_eq!(stored[0]["data"]["cacheType"], "fresh");
}

#[tokio::test]
async fn test_remote_cache_hit_skips_completion() {
    let metrics = MockServer::start().await;
    let completion = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ai-explanation/data%20science:course~stats"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sections": {"📋 Summary": "From the shared cache."},
            "cached": false,
            "cacheType": "fresh",
            "fallbackMode": false
        })))
        .mount(&metrics)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(REPLY)))
        .expect(0)
        .mount(&completion)
        .await;

    let response = bridge_for(&metrics, &completion)
        .format_explanation(
            ExplanationRequest::Raw(json!({"bm25": 3.2})),
            details(),
            "Data Science",
        )
        .await
        .unwrap();
    assert!(response.cached);
    assert_eq!(response.cache_type, Some(CacheType::Redis));
    assert_eq!(response.sections.get("📋 Summary"), Some("From the shared cache."));
}

#[tokio::test]
async fn test_completion_failure_returns_fixed_failure() {
    let metrics = MockServer::start().await;
    let completion = MockServer::start().await;
    mount_empty_remote_cache(&metrics).await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&completion)
        .await;

    let bridge = bridge_for(&metrics, &completion);
    let response = bridge
        .format_explanation(ExplanationRequest::FallbackMode, details(), "Data Science")
        .await
        .unwrap();
    assert!(response.error);
    assert!(!response.cached);
    assert!(response.sections.get("❌ Error").is_some());
    assert_eq!(bridge.explanations().session_len().await, 0);
}

// ─────────────────────── stdio ───────────────────────

#[tokio::test]
async fn test_stdio_round_trip() {
    let metrics = MockServer::start().await;
    let completion = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "unhealthy"})))
        .mount(&metrics)
        .await;
    Mock::given(method("GET"))
        .and(path("/metrics/go/g1"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&metrics)
        .await;

    let handler = ProtocolHandler::new(Arc::new(bridge_for(&metrics, &completion)));
    let transport = StdioTransport::new(handler);

    let input = concat!(
        "{\"id\":1,\"action\":\"checkHealthService\"}\n",
        "\n",
        "not json\n",
        "{\"id\":2,\"action\":\"fetchMetrics\",\"query\":\"Go\",\"productId\":\"course~g1\"}\n",
    );
    let mut output = Vec::new();
    transport
        .run_with(BufReader::new(input.as_bytes()), &mut output)
        .await
        .unwrap();

    let replies: Vec<Value> = String::from_utf8(output)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(replies.len(), 3);
    assert_eq!(replies[0], json!({"id": 1, "success": true, "healthy": false}));
    assert_eq!(replies[1]["id"], Value::Null);
    assert_eq!(replies[1]["error"]["code"], -32700);
    assert_eq!(replies[2]["id"], 2);
    assert_eq!(replies[2]["success"], true);
    assert_eq!(replies[2]["metrics"], Value::Null);
    assert_eq!(replies[2]["normalizedQuery"], "go");
}

#[tokio::test]
async fn test_stdio_rejects_oversized_line_and_continues() {
    let metrics = MockServer::start().await;
    let completion = MockServer::start().await;
    let handler = ProtocolHandler::new(Arc::new(bridge_for(&metrics, &completion)));
    let transport = StdioTransport::new(handler).with_max_line_bytes(128);

    let input = format!(
        "{{\"id\":1,\"action\":\"fetchMetrics\",\"query\":\"{}\",\"productId\":\"p\"}}\n{{\"id\":2,\"action\":\"ping\"}}\n",
        "q".repeat(256)
    );
    let mut output = Vec::new();
    transport
        .run_with(BufReader::new(input.as_bytes()), &mut output)
        .await
        .unwrap();

    let replies: Vec<Value> = String::from_utf8(output)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0]["id"], Value::Null);
    assert_eq!(replies[0]["error"]["code"], -32600);
    assert_eq!(replies[1], json!({"id": 2, "success": true}));
    assert!(metrics.received_requests().await.unwrap_or_default().is_empty());
}

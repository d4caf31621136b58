//! Search request rewriting and response capture.
//!
//! [`QueryRewriter`] adds the relevance-explanation field to the product
//! fragment of outgoing search queries and owns the one-way circuit breaker
//! that stops rewriting once the backend rejects the field.
//! [`InterceptingTransport`] wraps a [`Transport`] (fetch-style or XHR-style),
//! applies the rewrite on the way out and publishes matching responses on
//! the [`EventBus`] on the way back, leaving the caller's response intact.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::events::{EventBus, InterceptedResponse, LensEvent};
use crate::extractor::request_metadata;
use crate::types::{LensError, LensResult};

/// Rewrite and capture settings.
#[derive(Debug, Clone)]
pub struct InterceptorConfig {
    /// Substring identifying the search endpoint URL.
    pub endpoint_marker: String,
    /// Substring a request body must contain to be considered a search.
    pub operation_marker: String,
    /// Field requested in addition to what the page asks for.
    pub injected_field: String,
    /// Header that opens the product fragment.
    pub product_fragment: String,
    /// Field that closes the product fragment; injection goes right before it.
    pub anchor_field: String,
    /// Field the anchor must directly follow.
    pub preceding_field: String,
    pub client_name: String,
    pub schema_version: String,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            endpoint_marker: "graphql".to_string(),
            operation_marker: "Search_ProductHit".to_string(),
            injected_field: "searchExplanation".to_string(),
            product_fragment: "fragment SearchProductHit on Search_ProductHit {".to_string(),
            anchor_field: "__typename".to_string(),
            preceding_field: "tagline".to_string(),
            client_name: "devGatewayGql".to_string(),
            schema_version: "cluster:search-application-vpcprodpreview-1685".to_string(),
        }
    }
}

/// Outcome of trying to augment one query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Injection {
    /// The field was added. `contaminated` names any other fragment that
    /// ended up containing it.
    Injected {
        query: String,
        contaminated: Vec<String>,
    },
    AlreadyPresent,
    /// The circuit breaker has tripped.
    Disabled,
    NoProductHit,
    FragmentNotFound,
    /// The product fragment has no `tagline` directly before its closing anchor.
    AnchorMissing,
}

impl Injection {
    /// The query to send, given the original.
    pub fn into_query(self, original: &str) -> String {
        match self {
            Injection::Injected { query, .. } => query,
            _ => original.to_string(),
        }
    }

    pub fn is_injected(&self) -> bool {
        matches!(self, Injection::Injected { .. })
    }
}

/// Result of rewriting a request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyRewrite {
    Untouched,
    Rewritten { body: String, operations: usize },
}

impl BodyRewrite {
    pub fn into_body(self, original: &str) -> String {
        match self {
            BodyRewrite::Rewritten { body, .. } => body,
            BodyRewrite::Untouched => original.to_string(),
        }
    }
}

/// A fragment definition located inside a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentSpan {
    pub name: String,
    pub start: usize,
    pub end: usize,
}

/// Split a query into its fragment definitions. Each fragment runs until
/// the next fragment header or the end of the text.
pub fn fragment_spans(query: &str) -> Vec<FragmentSpan> {
    let header = match Regex::new(r"fragment\s+(\w+)\s+on\s+\w+\s*\{") {
        Ok(re) => re,
        Err(_) => return Vec::new(),
    };

    let heads: Vec<(usize, String)> = header
        .captures_iter(query)
        .filter_map(|c| {
            let whole = c.get(0)?;
            let name = c.get(1)?;
            Some((whole.start(), name.as_str().to_string()))
        })
        .collect();

    heads
        .iter()
        .enumerate()
        .map(|(i, (start, name))| FragmentSpan {
            name: name.clone(),
            start: *start,
            end: heads.get(i + 1).map(|(s, _)| *s).unwrap_or(query.len()),
        })
        .collect()
}

/// Stateful query rewriter with a one-way circuit breaker.
#[derive(Debug)]
pub struct QueryRewriter {
    config: InterceptorConfig,
    disabled: AtomicBool,
}

impl QueryRewriter {
    pub fn new(config: InterceptorConfig) -> Self {
        Self {
            config,
            disabled: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &InterceptorConfig {
        &self.config
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    /// Trip the breaker. There is no way back for this rewriter.
    pub fn disable(&self, reason: &str) {
        if !self.disabled.swap(true, Ordering::SeqCst) {
            tracing::warn!("Disabling query modification: {reason}");
        }
    }

    /// Add the explanation field to the product fragment of `query`.
    pub fn add_search_explanation_to_query(&self, query: &str) -> Injection {
        let cfg = &self.config;
        if self.is_disabled() {
            return Injection::Disabled;
        }
        if !query.contains(&cfg.operation_marker) {
            return Injection::NoProductHit;
        }
        if query.contains(&cfg.injected_field) {
            return Injection::AlreadyPresent;
        }

        let Some(start) = query.find(&cfg.product_fragment) else {
            tracing::debug!("Product fragment not found in query");
            return Injection::FragmentNotFound;
        };
        let body_start = start + cfg.product_fragment.len();
        let end = query[body_start..]
            .find("fragment ")
            .map(|p| body_start + p)
            .unwrap_or(query.len());
        let fragment = &query[start..end];

        let pattern = format!(
            r"({}\s*?)({}\s*\}})",
            regex::escape(&cfg.preceding_field),
            regex::escape(&cfg.anchor_field)
        );
        let anchor = match Regex::new(&pattern) {
            Ok(re) => re,
            Err(e) => {
                tracing::warn!("Invalid anchor pattern: {e}");
                return Injection::AnchorMissing;
            }
        };
        let Some(caps) = anchor.captures(fragment) else {
            tracing::warn!(
                "Product fragment has no {} before {}, leaving query unchanged",
                cfg.preceding_field,
                cfg.anchor_field
            );
            return Injection::AnchorMissing;
        };
        let (Some(lead), Some(close)) = (caps.get(1), caps.get(2)) else {
            return Injection::AnchorMissing;
        };

        let mut rewritten_fragment = String::with_capacity(fragment.len() + 32);
        rewritten_fragment.push_str(&fragment[..lead.start()]);
        rewritten_fragment.push_str(lead.as_str().trim_end());
        rewritten_fragment.push_str("\n  ");
        rewritten_fragment.push_str(&cfg.injected_field);
        rewritten_fragment.push_str("\n  ");
        rewritten_fragment.push_str(close.as_str());
        rewritten_fragment.push_str(&fragment[close.end()..]);

        let rewritten = format!("{}{}{}", &query[..start], rewritten_fragment, &query[end..]);
        let contaminated = self.contaminated_fragments(&rewritten);
        for name in &contaminated {
            tracing::warn!("Fragment {name} unexpectedly contains {}", cfg.injected_field);
        }

        tracing::debug!("Injected {} into product fragment", cfg.injected_field);
        Injection::Injected {
            query: rewritten,
            contaminated,
        }
    }

    fn contaminated_fragments(&self, query: &str) -> Vec<String> {
        let product_name = fragment_spans(&self.config.product_fragment)
            .into_iter()
            .next()
            .map(|f| f.name);
        fragment_spans(query)
            .into_iter()
            .filter(|f| Some(&f.name) != product_name.as_ref())
            .filter(|f| query[f.start..f.end].contains(&self.config.injected_field))
            .map(|f| f.name)
            .collect()
    }

    /// Rewrite an outgoing request body. Anything that does not look like a
    /// search request, or does not parse, comes back untouched.
    pub fn rewrite_body(&self, url: &str, body: &str) -> BodyRewrite {
        if !url.contains(&self.config.endpoint_marker) || !body.contains(&self.config.operation_marker)
        {
            return BodyRewrite::Untouched;
        }

        let mut parsed: Value = match serde_json::from_str(body) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!("Leaving unparseable search body untouched: {e}");
                return BodyRewrite::Untouched;
            }
        };

        let operations = if let Some(ops) = parsed.as_array_mut() {
            ops.iter_mut()
                .map(|op| self.rewrite_operation(op))
                .filter(|changed| *changed)
                .count()
        } else if parsed.is_object() {
            usize::from(self.rewrite_operation(&mut parsed))
        } else {
            0
        };
        if operations == 0 {
            return BodyRewrite::Untouched;
        }

        match serde_json::to_string(&parsed) {
            Ok(body) => {
                tracing::info!("Rewrote {operations} search operation(s)");
                BodyRewrite::Rewritten { body, operations }
            }
            Err(e) => {
                tracing::debug!("Could not re-serialize rewritten body: {e}");
                BodyRewrite::Untouched
            }
        }
    }

    fn rewrite_operation(&self, operation: &mut Value) -> bool {
        let Some(query) = operation.get("query").and_then(Value::as_str) else {
            return false;
        };
        let Injection::Injected { query, .. } = self.add_search_explanation_to_query(query) else {
            return false;
        };
        let Some(op) = operation.as_object_mut() else {
            return false;
        };

        op.insert("query".to_string(), Value::String(query));
        let context = op
            .entry("context")
            .or_insert_with(|| Value::Object(Map::new()));
        if !context.is_object() {
            *context = Value::Object(Map::new());
        }
        if let Some(ctx) = context.as_object_mut() {
            ctx.insert(
                "clientName".to_string(),
                Value::String(self.config.client_name.clone()),
            );
            ctx.insert(
                "schemaVersion".to_string(),
                Value::String(self.config.schema_version.clone()),
            );
        }
        true
    }

    /// Scan a response for schema errors that mention the injected field and
    /// trip the breaker if one is found. Returns the offending message.
    pub fn observe_response_errors(&self, payload: &Value) -> Option<String> {
        let results: Vec<&Value> = match payload {
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };

        let message = results
            .iter()
            .filter_map(|r| r.get("errors").and_then(Value::as_array))
            .flatten()
            .filter_map(|e| e.get("message").and_then(Value::as_str))
            .find(|m| m.contains(&self.config.injected_field))?
            .to_string();

        self.disable(&message);
        Some(message)
    }
}

impl Default for QueryRewriter {
    fn default() -> Self {
        Self::new(InterceptorConfig::default())
    }
}

/// Which page entry point a request went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Fetch,
    Xhr,
}

/// Outgoing request as seen by a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn post(url: &str, body: &str) -> Self {
        Self {
            method: "POST".to_string(),
            url: url.to_string(),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Some(body.to_string()),
        }
    }

    pub fn get(url: &str) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.to_string(),
            headers: Vec::new(),
            body: None,
        }
    }
}

/// Response returned by a transport. `body` is reference-counted so the
/// interceptor can read it without taking it from the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// An HTTP entry point of the page.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> LensResult<HttpResponse>;
}

/// Wraps a transport with query rewriting and response capture.
pub struct InterceptingTransport<T: Transport> {
    inner: T,
    kind: TransportKind,
    rewriter: Arc<QueryRewriter>,
    bus: EventBus,
}

impl<T: Transport> InterceptingTransport<T> {
    pub fn new(inner: T, kind: TransportKind, rewriter: Arc<QueryRewriter>, bus: EventBus) -> Self {
        Self {
            inner,
            kind,
            rewriter,
            bus,
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    fn observe_request(&self, url: &str, body: &str) {
        let Ok(operations) = serde_json::from_str::<Value>(body) else {
            return;
        };
        if let Some(metadata) = request_metadata(&operations, Some(url)) {
            tracing::debug!("Observed search request for '{}'", metadata.query);
            self.bus.emit(LensEvent::RequestObserved(metadata));
        }
    }

    fn capture(&self, url: &str, response: &HttpResponse) {
        let payload: Value = match serde_json::from_slice(&response.body) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!("Ignoring non-JSON response from {url}: {e}");
                return;
            }
        };

        if let Some(reason) = self.rewriter.observe_response_errors(&payload) {
            self.bus.emit(LensEvent::BreakerTripped { reason });
        }

        self.bus.emit(LensEvent::ResponseIntercepted(InterceptedResponse {
            url: url.to_string(),
            payload,
            transport: self.kind,
            timestamp: Utc::now(),
        }));
    }
}

#[async_trait]
impl<T: Transport> Transport for InterceptingTransport<T> {
    async fn send(&self, mut request: HttpRequest) -> LensResult<HttpResponse> {
        if let Some(body) = request.body.take() {
            if request.url.contains(&self.rewriter.config().endpoint_marker) {
                self.observe_request(&request.url, &body);
            }
            let rewritten = self.rewriter.rewrite_body(&request.url, &body);
            request.body = Some(rewritten.into_body(&body));
        }

        let url = request.url.clone();
        let response = self.inner.send(request).await?;

        if url.contains(&self.rewriter.config().endpoint_marker) {
            self.capture(&url, &response);
        }
        Ok(response)
    }
}

/// Production transport backed by `reqwest`.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout_ms: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> LensResult<HttpResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| LensError::Transport(format!("invalid method {}: {e}", request.method)))?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| LensError::Transport(e.to_string()))?;
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = resp
            .bytes()
            .await
            .map_err(|e| LensError::Transport(e.to_string()))?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

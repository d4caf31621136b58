//! Session-scoped store of captured search responses.
//!
//! Infinite scroll and pagination deliver results across many responses.
//! The [`ResponseStore`] keeps every accepted response in arrival order and
//! synthesizes one combined payload shaped like a regular search response,
//! so extraction does not care whether it sees one response or many.

use chrono::Utc;
use serde_json::{json, Value};

use crate::events::InterceptedResponse;
use crate::extractor::product_elements;
use crate::types::CapturedResponse;

/// URL marker of the search operation's responses.
pub const SEARCH_URL_MARKER: &str = "opname=Search";
/// Index name of the synthesized combined sub-result.
pub const COMBINED_INDEX_NAME: &str = "combined_responses";

/// Append-only store of captured search responses for one page view.
#[derive(Debug, Default)]
pub struct ResponseStore {
    responses: Vec<CapturedResponse>,
    next_sequence: u64,
}

impl ResponseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an intercepted response if it belongs to the search operation.
    pub fn accept(&mut self, event: &InterceptedResponse) -> bool {
        if !event.url.contains(SEARCH_URL_MARKER) {
            tracing::debug!("Ignoring non-search response from {}", event.url);
            return false;
        }

        self.next_sequence += 1;
        self.responses.push(CapturedResponse {
            url: event.url.clone(),
            payload: event.payload.clone(),
            captured_at: event.timestamp,
            sequence: self.next_sequence,
        });
        tracing::info!(
            "Accumulated response #{} ({} total)",
            self.next_sequence,
            self.responses.len()
        );
        true
    }

    /// Append a raw payload captured now. Same filtering as [`Self::accept`].
    pub fn accept_payload(&mut self, url: &str, payload: Value) -> bool {
        self.accept(&InterceptedResponse {
            url: url.to_string(),
            payload,
            transport: crate::interceptor::TransportKind::Fetch,
            timestamp: Utc::now(),
        })
    }

    pub fn captured(&self) -> &[CapturedResponse] {
        &self.responses
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }

    pub fn latest(&self) -> Option<&CapturedResponse> {
        self.responses.last()
    }

    /// Every product element across all responses in arrival order, tagged
    /// with `_responseIndex` and `_searchIndex`. Duplicates are kept.
    pub fn merged_elements(&self) -> Vec<Value> {
        let mut merged = Vec::new();
        for (response_index, response) in self.responses.iter().enumerate() {
            for located in product_elements(&response.payload) {
                let mut element = located.element.clone();
                if let Some(obj) = element.as_object_mut() {
                    obj.insert("_responseIndex".to_string(), json!(response_index));
                    obj.insert("_searchIndex".to_string(), json!(located.search_index));
                }
                merged.push(element);
            }
        }
        merged
    }

    /// The combined view, or `None` before anything was captured.
    pub fn merged_view(&self) -> Option<Value> {
        if self.responses.is_empty() {
            return None;
        }
        Some(json!([{
            "data": {
                "SearchResult": {
                    "search": [{
                        "elements": self.merged_elements(),
                        "source": { "indexName": COMBINED_INDEX_NAME }
                    }]
                }
            }
        }]))
    }

    /// Forget everything. Called on full page navigation.
    pub fn reset(&mut self) {
        tracing::info!("Resetting response store ({} responses)", self.responses.len());
        self.responses.clear();
        self.next_sequence = 0;
    }
}

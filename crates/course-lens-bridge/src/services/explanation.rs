//! Explanation formatting with a two-level cache.
//!
//! Lookups go to the in-process session cache first, then the remote cache
//! on the metrics service, and only then to the completion API. Fresh
//! results are written back to both caches.

use std::collections::HashMap;

use tokio::sync::Mutex;

use course_lens::messages::{
    cache_key, CacheType, ExplanationRequest, ExplanationResponse, ProductDetails,
};

use crate::types::BridgeResult;

use super::api::{ApiClient, CacheRecord};
use super::completion::CompletionClient;
use super::prompt::{build_prompt, parse_sections};

pub struct ExplanationService {
    api: ApiClient,
    completion: CompletionClient,
    session: Mutex<HashMap<String, ExplanationResponse>>,
}

impl ExplanationService {
    pub fn new(api: ApiClient, completion: CompletionClient) -> Self {
        Self {
            api,
            completion,
            session: Mutex::new(HashMap::new()),
        }
    }

    pub async fn session_len(&self) -> usize {
        self.session.lock().await.len()
    }

    pub async fn format(
        &self,
        explanation: ExplanationRequest,
        details: &ProductDetails,
        search_query: &str,
    ) -> BridgeResult<ExplanationResponse> {
        let key = cache_key(search_query, &details.product_id);

        if let Some(hit) = self.session.lock().await.get(&key).cloned() {
            tracing::debug!(%key, "Session cache hit");
            return Ok(hit.from_cache(CacheType::Session));
        }

        match self.api.cached_explanation(&key).await {
            Ok(Some(stored)) => {
                tracing::debug!(%key, "Remote cache hit");
                self.session.lock().await.insert(key, stored.clone());
                return Ok(stored.from_cache(CacheType::Redis));
            }
            Ok(None) => {}
            Err(e) => tracing::debug!(%key, "Remote cache lookup failed: {e}"),
        }

        let prompt = build_prompt(&explanation, details, search_query);
        let reply = self.completion.complete(&prompt).await?;
        let sections = parse_sections(&reply);
        tracing::info!(
            product_id = %details.product_id,
            sections = sections.len(),
            "Formatted explanation"
        );

        let result = ExplanationResponse {
            sections,
            cached: false,
            cache_type: Some(CacheType::Fresh),
            fallback_mode: explanation.is_fallback(),
            raw_response: Some(reply),
            query: Some(search_query.to_string()),
            product_id: Some(details.product_id.clone()),
            error: false,
        };

        self.session.lock().await.insert(key.clone(), result.clone());

        let record = CacheRecord {
            key: &key,
            data: &result,
            query: search_query,
            product_id: &details.product_id,
            title: &details.title,
        };
        if let Err(e) = self.api.store_explanation(&record).await {
            tracing::warn!(%key, "Failed to store explanation remotely: {e}");
        }

        Ok(result)
    }
}

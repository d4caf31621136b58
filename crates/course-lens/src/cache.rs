//! Reader for the page's normalized client-side object cache.
//!
//! The host page hydrates a GraphQL client cache keyed `Typename:id`. Product
//! hits found there are a third, independent source for correlation.

use serde_json::Value;

use crate::extractor::PRODUCT_HIT_TYPE;
use crate::types::CachedProduct;

const KEY_PREFIX: &str = "Search_ProductHit:";

fn text(obj: &Value, key: &str, default: &str) -> String {
    obj.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(default)
        .to_string()
}

/// Product hits stored in the cache state, in key order.
pub fn extract_cached_products(state: &Value) -> Vec<CachedProduct> {
    let Some(entries) = state.as_object() else {
        tracing::debug!("Client cache state is not an object");
        return Vec::new();
    };

    let products: Vec<CachedProduct> = entries
        .iter()
        .filter(|(key, _)| key.starts_with(KEY_PREFIX))
        .filter(|(_, obj)| obj.get("__typename").and_then(Value::as_str) == Some(PRODUCT_HIT_TYPE))
        .map(|(key, obj)| CachedProduct {
            cache_key: key.clone(),
            product_id: text(obj, "id", "No ID"),
            slug: text(obj, "slug", "No slug"),
            title: text(obj, "name", "No title"),
            entity_type: text(obj, "entityType", "Unknown"),
            partner_name: text(obj, "partnerName", "No partner"),
            url: text(obj, "url", "No URL"),
            raw: obj.clone(),
        })
        .collect();

    tracing::debug!("Found {} cached products", products.len());
    products
}

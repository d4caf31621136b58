//! Result extraction.
//!
//! Turns a search response payload (single-shot or the accumulator's merged
//! view) or a DOM fallback scrape into a flat, ordered list of
//! [`SearchResult`]s. Every field goes through [`FIELD_POLICIES`], so a
//! missing or malformed field never aborts the remaining elements.

use serde_json::Value;

use crate::accumulator::COMBINED_INDEX_NAME;
use crate::page::{ElementNode, PageSnapshot};
use crate::types::{Explanation, Provenance, Rating, RequestMetadata, SearchResult};

/// GraphQL type name of a product hit.
pub const PRODUCT_HIT_TYPE: &str = "Search_ProductHit";
/// GraphQL type name of an auto-complete suggestion hit.
pub const SUGGESTION_HIT_TYPE: &str = "Search_SuggestionHit";
/// Raw field carrying the relevance explanation.
pub const EXPLANATION_FIELD: &str = "searchExplanation";

/// Container the DOM fallback scans.
pub const RESULTS_CONTAINER_ID: &str = "searchResults";
/// Link prefixes the DOM fallback considers product links.
pub const PAGE_LINK_PREFIXES: &[&str] = &["/learn/", "/specializations/", "/professional-certificates/"];

/// Variable names that may carry the search text of a Search operation.
const QUERY_VARIABLES: &[&str] = &["query", "q", "searchTerm", "term", "keyword", "searchQuery"];

/// Fallback applied when none of a field's source keys holds a usable value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldDefault {
    Text(&'static str),
    EmptyList,
    Zero,
    False,
    UnknownRating,
}

/// Where a result field comes from and what it becomes when missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldPolicy {
    pub field: &'static str,
    /// Raw keys tried in order; the first usable value wins.
    pub sources: &'static [&'static str],
    pub default: FieldDefault,
}

pub const FIELD_POLICIES: &[FieldPolicy] = &[
    FieldPolicy {
        field: "title",
        sources: &["name", "title"],
        default: FieldDefault::Text("No title"),
    },
    FieldPolicy {
        field: "id",
        sources: &["id"],
        default: FieldDefault::Text("No ID"),
    },
    FieldPolicy {
        field: "url",
        sources: &["url"],
        default: FieldDefault::Text("No URL"),
    },
    FieldPolicy {
        field: "slug",
        sources: &["url"],
        default: FieldDefault::Text("No slug"),
    },
    FieldPolicy {
        field: "entityType",
        sources: &["__typename"],
        default: FieldDefault::Text("Unknown"),
    },
    FieldPolicy {
        field: "partners",
        sources: &["partners"],
        default: FieldDefault::EmptyList,
    },
    FieldPolicy {
        field: "rating",
        sources: &["avgProductRating"],
        default: FieldDefault::UnknownRating,
    },
    FieldPolicy {
        field: "ratingCount",
        sources: &["numProductRatings"],
        default: FieldDefault::Zero,
    },
    FieldPolicy {
        field: "isFree",
        sources: &["isCourseFree"],
        default: FieldDefault::False,
    },
    FieldPolicy {
        field: "description",
        sources: &["tagline"],
        default: FieldDefault::Text("No description"),
    },
    FieldPolicy {
        field: "skills",
        sources: &["skills"],
        default: FieldDefault::EmptyList,
    },
];

/// Look up the policy for a result field.
pub fn policy(field: &str) -> Option<&'static FieldPolicy> {
    FIELD_POLICIES.iter().find(|p| p.field == field)
}

/// Loose truthiness: null, false, 0, "" and missing all count as absent.
fn usable(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn source_value<'a>(hit: &'a Value, field: &str) -> Option<&'a Value> {
    let policy = policy(field)?;
    policy
        .sources
        .iter()
        .filter_map(|key| hit.get(*key))
        .find(|v| usable(v))
}

fn default_text(field: &str) -> String {
    match policy(field).map(|p| p.default) {
        Some(FieldDefault::Text(text)) => text.to_string(),
        _ => String::new(),
    }
}

fn text_field(hit: &Value, field: &str) -> String {
    match source_value(hit, field) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => default_text(field),
    }
}

fn list_field(hit: &Value, field: &str) -> Vec<String> {
    let Some(Value::Array(items)) = source_value(hit, field) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.clone()),
            Value::Object(obj) => obj.get("name").and_then(Value::as_str).map(str::to_string),
            _ => None,
        })
        .collect()
}

fn rating_field(hit: &Value) -> Rating {
    let score = match source_value(hit, "rating") {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.parse::<f64>().ok(),
        _ => None,
    };
    match score {
        Some(s) if s > 0.0 => Rating::Score(s),
        _ => Rating::Unknown,
    }
}

fn count_field(hit: &Value, field: &str) -> u64 {
    match source_value(hit, field) {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f > 0.0).map(|f| f as u64))
            .unwrap_or(0),
        _ => 0,
    }
}

fn flag_field(hit: &Value, field: &str) -> bool {
    matches!(source_value(hit, field), Some(Value::Bool(true)))
}

/// Slug of a product URL: strip a leading `/learn/`, then a leading `/`.
pub fn slug_from_url(url: &str) -> String {
    let rest = url.strip_prefix("/learn/").unwrap_or(url);
    rest.strip_prefix('/').unwrap_or(rest).to_string()
}

fn slug_field(hit: &Value) -> String {
    match source_value(hit, "slug") {
        Some(Value::String(url)) => slug_from_url(url),
        _ => default_text("slug"),
    }
}

fn explanation_field(hit: &Value) -> Explanation {
    match hit.get(EXPLANATION_FIELD) {
        None => Explanation::Absent,
        Some(Value::Null) => Explanation::Empty,
        Some(payload) => Explanation::Present(payload.clone()),
    }
}

/// Map one raw product hit through the field policies.
pub fn map_hit(hit: &Value, provenance: Provenance, found_at: String) -> SearchResult {
    SearchResult {
        id: text_field(hit, "id"),
        slug: slug_field(hit),
        title: text_field(hit, "title"),
        url: text_field(hit, "url"),
        entity_type: text_field(hit, "entityType"),
        partners: list_field(hit, "partners"),
        rating: rating_field(hit),
        rating_count: count_field(hit, "ratingCount"),
        is_free: flag_field(hit, "isFree"),
        description: text_field(hit, "description"),
        skills: list_field(hit, "skills"),
        explanation: explanation_field(hit),
        provenance,
        found_at,
        raw: hit.clone(),
    }
}

/// How a search sub-result is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubResultKind {
    Products,
    Suggestions,
    Other,
}

/// Classify one entry of `SearchResult.search`.
///
/// Heuristic: an index name mentioning products, or simply being first,
/// means products; an index name mentioning suggestions, or a first element
/// typed as a suggestion hit, means suggestions. Suggestions win ties.
/// Unfamiliar index naming can fool this.
pub fn classify_sub_result(index: usize, sub_result: &Value) -> SubResultKind {
    let index_name = sub_result
        .get("source")
        .and_then(|s| s.get("indexName"))
        .and_then(Value::as_str)
        .unwrap_or("");

    let first_type = sub_result
        .get("elements")
        .and_then(|e| e.get(0))
        .and_then(|e| e.get("__typename"))
        .and_then(Value::as_str);

    let is_suggestions =
        index_name.contains("suggestions") || first_type == Some(SUGGESTION_HIT_TYPE);
    let is_products =
        index_name.contains("products") || index_name.contains("consumer_products") || index == 0;

    if is_suggestions {
        SubResultKind::Suggestions
    } else if is_products {
        SubResultKind::Products
    } else {
        SubResultKind::Other
    }
}

/// Whether a raw element counts as a product hit.
pub fn is_product_element(element: &Value) -> bool {
    element.get("__typename").and_then(Value::as_str) == Some(PRODUCT_HIT_TYPE)
        || element.get("id").is_some_and(usable)
}

/// A product element together with where it was found.
#[derive(Debug, Clone, Copy)]
pub struct LocatedElement<'a> {
    pub search_index: usize,
    pub element_index: usize,
    pub element: &'a Value,
}

/// Every `SearchResult.search` array in a payload. Accepts an array of
/// operation results or a single result, with or without a `data` wrapper.
fn search_arrays(payload: &Value) -> Vec<&Vec<Value>> {
    let operations: Vec<&Value> = match payload {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    operations
        .into_iter()
        .filter_map(|op| {
            op.get("data")
                .unwrap_or(op)
                .get("SearchResult")
                .and_then(|r| r.get("search"))
                .and_then(Value::as_array)
        })
        .collect()
}

/// Product elements of every products sub-result, in encounter order.
pub fn product_elements(payload: &Value) -> Vec<LocatedElement<'_>> {
    let mut out = Vec::new();
    for search in search_arrays(payload) {
        for (search_index, sub_result) in search.iter().enumerate() {
            let kind = classify_sub_result(search_index, sub_result);
            if kind != SubResultKind::Products {
                tracing::debug!("Skipping sub-result {search_index} ({kind:?})");
                continue;
            }
            let Some(elements) = sub_result.get("elements").and_then(Value::as_array) else {
                continue;
            };
            out.extend(
                elements
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| is_product_element(e))
                    .map(|(element_index, element)| LocatedElement {
                        search_index,
                        element_index,
                        element,
                    }),
            );
        }
    }
    out
}

fn is_combined_view(payload: &Value) -> bool {
    search_arrays(payload).iter().any(|search| {
        search.iter().any(|sub| {
            sub.get("source")
                .and_then(|s| s.get("indexName"))
                .and_then(Value::as_str)
                == Some(COMBINED_INDEX_NAME)
        })
    })
}

/// Extract results from a response payload or the accumulator's merged view.
pub fn extract_from_response(payload: &Value) -> Vec<SearchResult> {
    let accumulated = is_combined_view(payload);
    let results: Vec<SearchResult> = product_elements(payload)
        .into_iter()
        .enumerate()
        .map(|(i, located)| {
            if accumulated {
                let origin = located
                    .element
                    .get("_responseIndex")
                    .map(Value::to_string)
                    .unwrap_or_else(|| "unknown".to_string());
                map_hit(
                    located.element,
                    Provenance::Accumulated,
                    format!("accumulated[{i}] from response {origin}"),
                )
            } else {
                map_hit(
                    located.element,
                    Provenance::Response,
                    format!(
                        "SearchResult.search[{}].elements[{}]",
                        located.search_index, located.element_index
                    ),
                )
            }
        })
        .collect();

    tracing::debug!("Extracted {} product results", results.len());
    results
}

fn is_page_link(node: &ElementNode) -> bool {
    node.is_anchor()
        && node
            .href()
            .is_some_and(|href| PAGE_LINK_PREFIXES.iter().any(|p| href.contains(p)))
}

fn slug_from_href(href: &str) -> String {
    let path = url::Url::parse(href)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| href.to_string());
    PAGE_LINK_PREFIXES
        .iter()
        .find_map(|prefix| {
            path.find(prefix).map(|pos| {
                path[pos + prefix.len()..]
                    .split(['/', '?'])
                    .next()
                    .unwrap_or("")
                    .to_string()
            })
        })
        .unwrap_or_default()
}

/// Decode the click-tracking payload on a node, if any.
pub fn decode_click_value(node: &ElementNode) -> Option<Value> {
    let raw = node.attr("data-click-value")?;
    match serde_json::from_str::<Value>(raw) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::debug!("Malformed data-click-value: {e}");
            None
        }
    }
}

/// DOM fallback used when no response was ever captured.
pub fn extract_from_page(page: &PageSnapshot) -> Vec<SearchResult> {
    let Some(container) = page.element_by_id(RESULTS_CONTAINER_ID) else {
        tracing::debug!("No #{RESULTS_CONTAINER_ID} container on page");
        return Vec::new();
    };

    let mut results = Vec::new();
    for link in page.find_descendants(container, is_page_link) {
        let card = page
            .closest(link, |n| n.has_attr("data-click-value"))
            .or_else(|| page.closest(link, |n| n.tag == "div" && n.class_name().contains("card")))
            .or_else(|| page.closest(link, |n| n.tag == "article"));
        let Some(card) = card else {
            continue;
        };

        let click_node = std::iter::once(card)
            .chain(page.descendants(card))
            .find(|id| page.node(*id).is_some_and(|n| n.has_attr("data-click-value")));
        let click = click_node
            .and_then(|id| page.node(id))
            .and_then(decode_click_value);
        let object_id = click
            .as_ref()
            .and_then(|c| c.get("objectID"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty());

        let title = page
            .find_descendant(card, ElementNode::is_heading)
            .map(|h| page.text_content(h))
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "No title".to_string());
        let href = page.node(link).and_then(ElementNode::href).unwrap_or("");
        let index = results.len();

        results.push(SearchResult {
            id: object_id.unwrap_or("No ID").to_string(),
            slug: slug_from_href(href),
            title: title.clone(),
            url: href.to_string(),
            entity_type: "PAGE_EXTRACTED".to_string(),
            partners: Vec::new(),
            rating: Rating::Unknown,
            rating_count: 0,
            is_free: false,
            description: "Extracted from page".to_string(),
            skills: Vec::new(),
            explanation: Explanation::Absent,
            provenance: Provenance::PageExtracted,
            found_at: format!("page.extractedCourses[{index}]"),
            raw: serde_json::json!({
                "title": title,
                "objectID": object_id,
                "url": href,
                "clickData": click,
            }),
        });
    }

    tracing::debug!("Extracted {} results from page", results.len());
    results
}

/// Input to [`extract`].
#[derive(Debug, Clone, Copy)]
pub enum ExtractSource<'a> {
    Response(&'a Value),
    Page(&'a PageSnapshot),
}

pub fn extract(source: ExtractSource<'_>) -> Vec<SearchResult> {
    match source {
        ExtractSource::Response(payload) => extract_from_response(payload),
        ExtractSource::Page(page) => extract_from_page(page),
    }
}

/// Search metadata from an outgoing request body (one operation or an
/// array), falling back to the request URL's `query`/`q` parameter.
pub fn request_metadata(operations: &Value, request_url: Option<&str>) -> Option<RequestMetadata> {
    let ops: Vec<&Value> = match operations {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };

    let from_operations = ops
        .into_iter()
        .filter(|op| op.get("operationName").and_then(Value::as_str) == Some("Search"))
        .find_map(|op| {
            let variables = op.get("variables")?;
            QUERY_VARIABLES
                .iter()
                .filter_map(|k| variables.get(*k).and_then(Value::as_str))
                .find(|q| !q.is_empty())
                .map(str::to_string)
        });
    if let Some(query) = from_operations {
        return Some(RequestMetadata {
            query,
            operation_name: "Search".to_string(),
            source: "operations".to_string(),
        });
    }

    let parsed = url::Url::parse(request_url?).ok()?;
    let query = parsed
        .query_pairs()
        .find(|(k, v)| (k == "query" || k == "q") && !v.is_empty())
        .map(|(_, v)| v.into_owned())?;
    Some(RequestMetadata {
        query,
        operation_name: "Search".to_string(),
        source: "url".to_string(),
    })
}

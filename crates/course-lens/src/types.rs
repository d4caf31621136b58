//! Core data types shared by every stage of the correlation pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::page::NodeId;

/// One intercepted search response, as stored by the accumulator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedResponse {
    pub url: String,
    pub payload: Value,
    pub captured_at: DateTime<Utc>,
    pub sequence: u64,
}

/// Average rating of a product, or unknown when the hit carries none.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum Rating {
    Score(f64),
    Unknown,
}

impl Rating {
    pub fn score(&self) -> Option<f64> {
        match self {
            Rating::Score(s) => Some(*s),
            Rating::Unknown => None,
        }
    }
}

impl std::fmt::Display for Rating {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rating::Score(s) => write!(f, "{s}"),
            Rating::Unknown => write!(f, "No rating"),
        }
    }
}

/// Relevance-explanation payload attached to a product hit.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "payload")]
pub enum Explanation {
    /// The augmented query succeeded and returned a payload.
    Present(Value),
    /// The field exists on the hit but is null.
    Empty,
    /// The hit carries no explanation field at all.
    #[default]
    Absent,
}

impl Explanation {
    pub fn is_absent(&self) -> bool {
        matches!(self, Explanation::Absent)
    }
}

/// Which extraction path produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Merged view over every captured response.
    Accumulated,
    /// A single response payload handed straight to the extractor.
    Response,
    /// DOM fallback scrape.
    PageExtracted,
}

/// Canonical, extractor-normalized search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub id: String,
    pub slug: String,
    pub title: String,
    pub url: String,
    pub entity_type: String,
    pub partners: Vec<String>,
    pub rating: Rating,
    pub rating_count: u64,
    pub is_free: bool,
    pub description: String,
    pub skills: Vec<String>,
    pub explanation: Explanation,
    pub provenance: Provenance,
    pub found_at: String,
    /// The raw hit the result was mapped from.
    pub raw: Value,
}

impl SearchResult {
    /// Read a string field of the raw hit.
    pub fn raw_str(&self, key: &str) -> Option<&str> {
        self.raw.get(key).and_then(Value::as_str)
    }
}

/// Identifier pulled out of an on-screen card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum CardIdentifier {
    /// Decoded from the card's click-tracking payload.
    ObjectId {
        object_id: String,
        href: Option<String>,
        query: Option<String>,
        hit_position: Option<u64>,
    },
    /// Derived from the path of a product link.
    Slug { slug: String, href: String },
}

impl CardIdentifier {
    /// The identifier text used for lookups and display.
    pub fn key(&self) -> &str {
        match self {
            CardIdentifier::ObjectId { object_id, .. } => object_id,
            CardIdentifier::Slug { slug, .. } => slug,
        }
    }
}

/// Text shown on the card itself, independent of any result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardDisplay {
    pub title: String,
    pub partner: String,
    pub rating: String,
}

impl Default for CardDisplay {
    fn default() -> Self {
        Self {
            title: "No title found".to_string(),
            partner: "No partner found".to_string(),
            rating: "No rating found".to_string(),
        }
    }
}

/// A located product card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub node: NodeId,
    pub identifier: Option<CardIdentifier>,
    pub display: CardDisplay,
}

impl Card {
    /// Identifier text, or the fixed placeholder used in panels.
    pub fn product_id(&self) -> &str {
        self.identifier
            .as_ref()
            .map(CardIdentifier::key)
            .unwrap_or("No product ID found")
    }
}

/// Search metadata captured from the outgoing request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMetadata {
    pub query: String,
    pub operation_name: String,
    pub source: String,
}

/// A product entry read from the page's client-side object cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedProduct {
    pub cache_key: String,
    pub product_id: String,
    pub slug: String,
    pub title: String,
    pub entity_type: String,
    pub partner_name: String,
    pub url: String,
    pub raw: Value,
}

/// The correlation unit: one card and whatever could be paired with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub index: usize,
    pub card: Card,
    pub result: Option<SearchResult>,
    pub request: Option<RequestMetadata>,
    pub cached: Option<CachedProduct>,
}

impl Match {
    pub fn is_matched(&self) -> bool {
        self.result.is_some()
    }

    /// True when no source at all produced data for this card.
    pub fn is_bare(&self) -> bool {
        self.result.is_none() && self.request.is_none() && self.cached.is_none()
    }
}

/// Errors that can occur in the correlation core.
#[derive(thiserror::Error, Debug)]
pub enum LensError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Bridge error: {0}")]
    Bridge(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Render error: {0}")]
    Render(String),
}

/// Convenience result type.
pub type LensResult<T> = Result<T, LensError>;

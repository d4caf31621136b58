//! Card ↔ result correlation.
//!
//! Each card is paired with at most one result by trying an ordered list of
//! [`MatchStrategy`]s. Within a strategy the scan is linear and the first
//! candidate in extraction order wins, so duplicate identifiers always
//! resolve to the earliest result.

use serde::Serialize;
use serde_json::Value;

use crate::types::{CachedProduct, Card, CardIdentifier, Match, RequestMetadata, SearchResult};

/// Anything a card can be matched against.
pub trait Candidate {
    fn primary_id(&self) -> &str;
    fn slug(&self) -> &str;
    fn url(&self) -> &str;
    fn raw(&self) -> &Value;
}

impl Candidate for SearchResult {
    fn primary_id(&self) -> &str {
        &self.id
    }

    fn slug(&self) -> &str {
        &self.slug
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn raw(&self) -> &Value {
        &self.raw
    }
}

impl Candidate for CachedProduct {
    fn primary_id(&self) -> &str {
        &self.product_id
    }

    fn slug(&self) -> &str {
        &self.slug
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn raw(&self) -> &Value {
        &self.raw
    }
}

fn raw_str<'a>(candidate: &'a dyn Candidate, key: &str) -> Option<&'a str> {
    candidate.raw().get(key).and_then(Value::as_str)
}

/// One way of pairing a card identifier with a candidate.
pub trait MatchStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether `candidate` is the card's item. Strategies that do not apply
    /// to this kind of identifier return false.
    fn attempt(&self, identifier: &CardIdentifier, candidate: &dyn Candidate) -> bool;
}

/// Exact match on the click-tracking object id.
#[derive(Debug, Default, Clone, Copy)]
pub struct ObjectIdStrategy;

impl MatchStrategy for ObjectIdStrategy {
    fn name(&self) -> &'static str {
        "object_id"
    }

    fn attempt(&self, identifier: &CardIdentifier, candidate: &dyn Candidate) -> bool {
        let CardIdentifier::ObjectId { object_id, .. } = identifier else {
            return false;
        };
        candidate.primary_id() == object_id
            || raw_str(candidate, "objectID") == Some(object_id.as_str())
            || raw_str(candidate, "id") == Some(object_id.as_str())
    }
}

/// Match on a link slug: exact slug or id, or contained in the url.
#[derive(Debug, Default, Clone, Copy)]
pub struct SlugStrategy;

impl MatchStrategy for SlugStrategy {
    fn name(&self) -> &'static str {
        "slug"
    }

    fn attempt(&self, identifier: &CardIdentifier, candidate: &dyn Candidate) -> bool {
        let CardIdentifier::Slug { slug, .. } = identifier else {
            return false;
        };
        if slug.is_empty() {
            return false;
        }
        candidate.slug() == slug
            || candidate.primary_id() == slug
            || candidate.url().contains(slug.as_str())
            || raw_str(candidate, "slug") == Some(slug.as_str())
            || raw_str(candidate, "url").is_some_and(|u| u.contains(slug.as_str()))
    }
}

/// Side information attached to every match of a pass.
#[derive(Debug, Clone, Default)]
pub struct CorrelationContext<'a> {
    pub request: Option<&'a RequestMetadata>,
    pub cached: &'a [CachedProduct],
}

/// Ordered strategy list.
pub struct Correlator {
    strategies: Vec<Box<dyn MatchStrategy>>,
}

impl Correlator {
    pub fn new(strategies: Vec<Box<dyn MatchStrategy>>) -> Self {
        Self { strategies }
    }

    /// Append a strategy, tried after the existing ones.
    pub fn with_strategy(mut self, strategy: Box<dyn MatchStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Index of the first candidate matching the card, and the strategy that found it.
    pub fn find<C: Candidate>(
        &self,
        identifier: Option<&CardIdentifier>,
        candidates: &[C],
    ) -> Option<(usize, &'static str)> {
        let identifier = identifier?;
        self.strategies.iter().find_map(|strategy| {
            candidates
                .iter()
                .position(|c| strategy.attempt(identifier, c))
                .map(|i| (i, strategy.name()))
        })
    }

    /// One match per card, in card order.
    pub fn correlate(
        &self,
        cards: &[Card],
        results: &[SearchResult],
        context: &CorrelationContext<'_>,
    ) -> Vec<Match> {
        cards
            .iter()
            .enumerate()
            .map(|(index, card)| {
                let identifier = card.identifier.as_ref();
                let result = self.find(identifier, results).map(|(i, strategy)| {
                    tracing::debug!("Card {index} matched result {i} via {strategy}");
                    results[i].clone()
                });
                let cached = self
                    .find(identifier, context.cached)
                    .map(|(i, _)| context.cached[i].clone());

                Match {
                    index,
                    card: card.clone(),
                    result,
                    request: context.request.cloned(),
                    cached,
                }
            })
            .collect()
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new(vec![Box::new(ObjectIdStrategy), Box::new(SlugStrategy)])
    }
}

/// Summary of a correlation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationReport {
    pub cards: usize,
    pub results: usize,
    pub matched: usize,
    pub unmatched: usize,
    pub without_identifier: usize,
    /// Card identifiers that found no result.
    pub missing_ids: Vec<String>,
}

impl CorrelationReport {
    pub fn from_matches(matches: &[Match], result_count: usize) -> Self {
        let matched = matches.iter().filter(|m| m.is_matched()).count();
        let without_identifier = matches.iter().filter(|m| m.card.identifier.is_none()).count();
        let missing_ids = matches
            .iter()
            .filter(|m| !m.is_matched())
            .filter_map(|m| m.card.identifier.as_ref().map(|i| i.key().to_string()))
            .collect();

        Self {
            cards: matches.len(),
            results: result_count,
            matched,
            unmatched: matches.len() - matched,
            without_identifier,
            missing_ids,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::map_hit;
    use crate::page::NodeId;
    use crate::types::{CardDisplay, Provenance};
    use serde_json::json;

    fn result(raw: Value) -> SearchResult {
        map_hit(&raw, Provenance::Response, String::new())
    }

    fn card(n: usize, identifier: Option<CardIdentifier>) -> Card {
        Card {
            node: NodeId(n),
            identifier,
            display: CardDisplay::default(),
        }
    }

    fn object_id(id: &str) -> Option<CardIdentifier> {
        Some(CardIdentifier::ObjectId {
            object_id: id.to_string(),
            href: None,
            query: None,
            hit_position: None,
        })
    }

    fn slug(s: &str) -> Option<CardIdentifier> {
        Some(CardIdentifier::Slug {
            slug: s.to_string(),
            href: format!("/learn/{s}"),
        })
    }

    #[test]
    fn test_exact_object_id() {
        let results = vec![result(json!({"id": "abc123", "name": "Only"}))];
        let matches = Correlator::default().correlate(
            &[card(0, object_id("abc123"))],
            &results,
            &CorrelationContext::default(),
        );
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].result.as_ref().unwrap().title, "Only");
    }

    #[test]
    fn test_tie_resolves_to_first() {
        let results = vec![
            result(json!({"id": "x", "name": "first"})),
            result(json!({"id": "dup", "name": "second"})),
            result(json!({"id": "dup", "name": "third"})),
        ];
        let matches = Correlator::default().correlate(
            &[card(0, object_id("dup"))],
            &results,
            &CorrelationContext::default(),
        );
        assert_eq!(matches[0].result.as_ref().unwrap().title, "second");
    }

    #[test]
    fn test_raw_object_id_field() {
        let results = vec![result(json!({"objectID": "course~z", "name": "raw"}))];
        let found = Correlator::default().find(object_id("course~z").as_ref(), &results);
        assert_eq!(found, Some((0, "object_id")));
    }

    #[test]
    fn test_slug_matching() {
        let results = vec![
            result(json!({"id": "a", "url": "/learn/python-basics"})),
            result(json!({"id": "b", "url": "/specializations/deep-learning"})),
        ];
        let correlator = Correlator::default();
        assert_eq!(correlator.find(slug("python-basics").as_ref(), &results), Some((0, "slug")));
        assert_eq!(correlator.find(slug("deep-learning").as_ref(), &results), Some((1, "slug")));
        assert_eq!(correlator.find(slug("").as_ref(), &results), None);
    }

    #[test]
    fn test_missing_identifier_yields_bare_match() {
        let results = vec![result(json!({"id": "a"}))];
        let matches = Correlator::default().correlate(
            &[card(0, None), card(1, object_id("a"))],
            &results,
            &CorrelationContext::default(),
        );
        assert_eq!(matches.len(), 2);
        assert!(matches[0].is_bare());
        assert!(matches[1].is_matched());

        let report = CorrelationReport::from_matches(&matches, results.len());
        assert_eq!(report.matched, 1);
        assert_eq!(report.without_identifier, 1);
        assert!(report.missing_ids.is_empty());
    }

    #[test]
    fn test_cached_products_and_request_metadata() {
        let cached = vec![CachedProduct {
            cache_key: "Search_ProductHit:course~q".to_string(),
            product_id: "course~q".to_string(),
            slug: "No slug".to_string(),
            title: "Cached".to_string(),
            entity_type: "Unknown".to_string(),
            partner_name: "No partner".to_string(),
            url: "/learn/q".to_string(),
            raw: json!({}),
        }];
        let request = RequestMetadata {
            query: "rust".to_string(),
            operation_name: "Search".to_string(),
            source: "operations".to_string(),
        };
        let context = CorrelationContext {
            request: Some(&request),
            cached: &cached,
        };
        let matches = Correlator::default().correlate(&[card(0, object_id("course~q"))], &[], &context);
        assert!(!matches[0].is_matched());
        assert!(!matches[0].is_bare());
        assert_eq!(matches[0].cached.as_ref().unwrap().title, "Cached");
        assert_eq!(matches[0].request.as_ref().unwrap().query, "rust");

        let report = CorrelationReport::from_matches(&matches, 0);
        assert_eq!(report.missing_ids, vec!["course~q".to_string()]);
    }

    struct Never;

    impl MatchStrategy for Never {
        fn name(&self) -> &'static str {
            "never"
        }

        fn attempt(&self, _: &CardIdentifier, _: &dyn Candidate) -> bool {
            false
        }
    }

    #[test]
    fn test_strategies_are_additive() {
        let correlator = Correlator::new(Vec::new()).with_strategy(Box::new(Never));
        assert_eq!(correlator.strategy_names(), vec!["never"]);
        let results = vec![result(json!({"id": "a"}))];
        assert_eq!(correlator.find(object_id("a").as_ref(), &results), None);
    }
}

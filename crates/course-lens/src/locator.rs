//! Product card location.
//!
//! Cards are found by walking up from product links to the first ancestor
//! that is big enough, has a heading or image, and looks like a card.

use std::collections::HashSet;

use regex::Regex;
use serde_json::Value;

use crate::extractor::decode_click_value;
use crate::page::{ElementNode, NodeId, PageSnapshot};
use crate::types::{Card, CardDisplay, CardIdentifier};

/// Whether the size criterion applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayoutPolicy {
    /// Enforce size only when the snapshot carries measurements.
    #[default]
    Auto,
    Enforce,
    Waive,
}

impl LayoutPolicy {
    fn enforces_size(self, page: &PageSnapshot) -> bool {
        match self {
            LayoutPolicy::Auto => page.is_measured(),
            LayoutPolicy::Enforce => true,
            LayoutPolicy::Waive => false,
        }
    }
}

/// Card detection settings.
#[derive(Debug, Clone)]
pub struct LocatorConfig {
    /// Link path prefixes, in slug-matching priority order.
    pub prefixes: Vec<String>,
    pub max_hops: usize,
    pub min_width: f64,
    pub min_height: f64,
    pub card_keywords: Vec<String>,
    pub layout: LayoutPolicy,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            prefixes: [
                "/learn/",
                "/browse/",
                "/professional-certificates/",
                "/degrees/",
                "/projects/",
                "/specializations/",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            max_hops: 10,
            min_width: 200.0,
            min_height: 200.0,
            card_keywords: ["card", "product", "course", "result"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            layout: LayoutPolicy::Auto,
        }
    }
}

/// Finds product cards in a snapshot and reads their identifiers.
#[derive(Debug, Clone)]
pub struct CardLocator {
    config: LocatorConfig,
    slug_patterns: Vec<Regex>,
}

impl CardLocator {
    pub fn new(config: LocatorConfig) -> Self {
        let slug_patterns = config
            .prefixes
            .iter()
            .filter_map(|p| Regex::new(&format!("{}([^/?]+)", regex::escape(p))).ok())
            .collect();
        Self {
            config,
            slug_patterns,
        }
    }

    pub fn config(&self) -> &LocatorConfig {
        &self.config
    }

    fn is_product_link(&self, node: &ElementNode) -> bool {
        node.is_anchor()
            && node
                .href()
                .is_some_and(|href| self.config.prefixes.iter().any(|p| href.contains(p.as_str())))
    }

    fn is_card(&self, page: &PageSnapshot, id: NodeId, check_size: bool) -> bool {
        let Some(node) = page.node(id) else {
            return false;
        };

        if check_size {
            let big_enough = node.rect.is_some_and(|r| {
                r.width > self.config.min_width && r.height > self.config.min_height
            });
            if !big_enough {
                return false;
            }
        }

        let has_content = page
            .find_descendant(id, |n| n.tag == "img" || n.is_heading())
            .is_some();
        if !has_content {
            return false;
        }

        let class = node.class_name().to_lowercase();
        self.config
            .card_keywords
            .iter()
            .any(|k| class.contains(k.as_str()))
            || node.tag == "article"
            || node.has_attr("data-testid")
    }

    /// Card containers in document order of their first product link.
    pub fn find_cards(&self, page: &PageSnapshot) -> Vec<NodeId> {
        let check_size = self.config.layout.enforces_size(page);
        let mut seen = HashSet::new();
        let mut cards = Vec::new();

        for link in page.query_all(|n| self.is_product_link(n)) {
            let container = page
                .ancestors(link)
                .into_iter()
                .take(self.config.max_hops)
                .find(|a| self.is_card(page, *a, check_size));
            if let Some(card) = container {
                if seen.insert(card) {
                    cards.push(card);
                }
            }
        }

        tracing::debug!("Located {} product cards", cards.len());
        cards
    }

    /// Identifier of a card: click-tracking object id first, link slug second.
    pub fn identify(&self, page: &PageSnapshot, card: NodeId) -> Option<CardIdentifier> {
        let click = std::iter::once(card)
            .chain(page.descendants(card))
            .filter_map(|id| page.node(id))
            .find(|n| n.has_attr("data-click-value"))
            .and_then(decode_click_value);

        if let Some(click) = click {
            let object_id = match click.get("objectID") {
                Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            };
            if let Some(object_id) = object_id {
                return Some(CardIdentifier::ObjectId {
                    object_id,
                    href: click.get("href").and_then(Value::as_str).map(str::to_string),
                    query: click.get("query").and_then(Value::as_str).map(str::to_string),
                    hit_position: click.get("hitPosition").and_then(Value::as_u64),
                });
            }
        }

        for link in page.find_descendants(card, |n| self.is_product_link(n)) {
            let Some(href) = page.node(link).and_then(ElementNode::href) else {
                continue;
            };
            let slug = self
                .slug_patterns
                .iter()
                .find_map(|re| re.captures(href).and_then(|c| c.get(1)));
            if let Some(slug) = slug {
                return Some(CardIdentifier::Slug {
                    slug: slug.as_str().to_string(),
                    href: href.to_string(),
                });
            }
        }

        None
    }

    /// Title, partner and rating text shown on the card.
    pub fn display(&self, page: &PageSnapshot, card: NodeId) -> CardDisplay {
        let defaults = CardDisplay::default();
        let title = first_text(page, card, |n| n.tag == "h3")
            .or_else(|| first_text(page, card, |n| n.tag == "h2"))
            .or_else(|| first_text(page, card, |n| n.tag == "h1"))
            .or_else(|| first_text(page, card, |n| n.attr("data-testid") == Some("card-title")));
        let partner = first_text(page, card, |n| n.attr("data-testid") == Some("partner-name"))
            .or_else(|| first_text(page, card, |n| n.has_class("partner-name")));
        let rating = first_text(page, card, |n| n.attr("data-testid") == Some("rating"))
            .or_else(|| first_text(page, card, |n| n.has_class("rating")));

        CardDisplay {
            title: title.unwrap_or(defaults.title),
            partner: partner.unwrap_or(defaults.partner),
            rating: rating.unwrap_or(defaults.rating),
        }
    }

    /// Locate every card with its identifier and display text.
    pub fn locate(&self, page: &PageSnapshot) -> Vec<Card> {
        self.find_cards(page)
            .into_iter()
            .map(|node| Card {
                node,
                identifier: self.identify(page, node),
                display: self.display(page, node),
            })
            .collect()
    }
}

fn first_text<F>(page: &PageSnapshot, card: NodeId, pred: F) -> Option<String>
where
    F: Fn(&ElementNode) -> bool,
{
    page.find_descendants(card, pred)
        .into_iter()
        .map(|id| page.text_content(id))
        .find(|t| !t.is_empty())
}

impl Default for CardLocator {
    fn default() -> Self {
        Self::new(LocatorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::Rect;

    fn card(page: &mut PageSnapshot, parent: NodeId, rect: Rect, href: &str) -> NodeId {
        let card = page.append(
            Some(parent),
            ElementNode::new("div")
                .with_attr("class", "cds-ProductCard")
                .with_rect(rect),
        );
        page.append(Some(card), ElementNode::new("h3").with_text("Title"));
        let inner = page.append(Some(card), ElementNode::new("div"));
        page.append(Some(inner), ElementNode::new("a").with_attr("href", href));
        page.append(Some(inner), ElementNode::new("a").with_attr("href", href));
        card
    }

    #[test]
    fn test_dedup_and_size_threshold() {
        let mut page = PageSnapshot::new(None);
        let body = page.append(None, ElementNode::new("body"));
        let big = card(&mut page, body, Rect::new(0.0, 0.0, 300.0, 320.0), "/learn/big");
        card(&mut page, body, Rect::new(0.0, 400.0, 200.0, 320.0), "/learn/small");

        let locator = CardLocator::default();
        assert_eq!(locator.find_cards(&page), vec![big]);
    }

    #[test]
    fn test_unmeasured_snapshot_waives_size() {
        let html = r#"<html><body>
            <article><h2>Course</h2><a href="/projects/build-a-cli">Open</a></article>
        </body></html>"#;
        let page = PageSnapshot::from_html(html, None);
        let cards = CardLocator::default().locate(&page);
        assert_eq!(cards.len(), 1);
        assert_eq!(
            cards[0].identifier,
            Some(CardIdentifier::Slug {
                slug: "build-a-cli".to_string(),
                href: "/projects/build-a-cli".to_string()
            })
        );
        assert_eq!(cards[0].display.title, "Course");
        assert_eq!(cards[0].display.partner, "No partner found");
    }

    #[test]
    fn test_hop_bound() {
        let mut page = PageSnapshot::new(None);
        let outer = page.append(
            None,
            ElementNode::new("article").with_rect(Rect::new(0.0, 0.0, 400.0, 400.0)),
        );
        page.append(Some(outer), ElementNode::new("img"));
        let mut parent = outer;
        for _ in 0..10 {
            parent = page.append(Some(parent), ElementNode::new("span"));
        }
        page.append(Some(parent), ElementNode::new("a").with_attr("href", "/learn/deep"));

        let mut locator = CardLocator::default();
        assert!(locator.find_cards(&page).is_empty());

        locator.config.max_hops = 11;
        assert_eq!(locator.find_cards(&page), vec![outer]);
    }

    #[test]
    fn test_identifier_priority() {
        let mut page = PageSnapshot::new(None);
        let body = page.append(None, ElementNode::new("body"));
        let c = card(&mut page, body, Rect::new(0.0, 0.0, 300.0, 300.0), "/learn/slugged");
        let locator = CardLocator::default();
        assert_eq!(locator.identify(&page, c).unwrap().key(), "slugged");

        page.append(
            Some(c),
            ElementNode::new("div").with_attr(
                "data-click-value",
                r#"{"objectID":"course~obj","href":"/learn/slugged","hitPosition":3}"#,
            ),
        );
        match locator.identify(&page, c) {
            Some(CardIdentifier::ObjectId {
                object_id,
                hit_position,
                ..
            }) => {
                assert_eq!(object_id, "course~obj");
                assert_eq!(hit_position, Some(3));
            }
            other => panic!("unexpected identifier {other:?}"),
        }
    }

    #[test]
    fn test_malformed_click_value_falls_back_to_slug() {
        let mut page = PageSnapshot::new(None);
        let body = page.append(None, ElementNode::new("body"));
        let c = card(&mut page, body, Rect::new(0.0, 0.0, 300.0, 300.0), "/degrees/mba?x=1");
        page.append(Some(c), ElementNode::new("div").with_attr("data-click-value", "{oops"));
        let id = CardLocator::default().identify(&page, c).unwrap();
        assert_eq!(id.key(), "mba");
    }

    #[test]
    fn test_no_identifier() {
        let mut page = PageSnapshot::new(None);
        let c = page.append(None, ElementNode::new("article"));
        assert!(CardLocator::default().identify(&page, c).is_none());
    }
}

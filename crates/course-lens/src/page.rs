//! Headless page model.
//!
//! A [`PageSnapshot`] is an arena of element nodes captured from the host
//! page: tag, attributes, direct text, an optional measured bounding box,
//! and parent/child links. Snapshots come from two places:
//!
//! - static HTML parsed with `scraper` (no layout, so `measured` is false)
//! - a JSON node list serialized by an in-page agent, rectangles included
//!
//! Everything downstream (card location, DOM fallback extraction, mutation
//! relevance) only ever talks to this model, never to a live DOM.

use std::collections::BTreeMap;

use regex::Regex;
use scraper::{ElementRef, Html, Node};
use serde::{Deserialize, Serialize};

use crate::types::{LensError, LensResult};

/// Path prefixes whose appearance in added nodes makes a mutation relevant.
pub const MUTATION_PREFIXES: &[&str] = &["/learn/", "/browse/", "/professional-certificates/"];

/// Handle to a node inside a [`PageSnapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

/// Rendered bounding box in viewport pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }
}

/// One element of the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementNode {
    pub tag: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
    /// Direct text children, whitespace-collapsed.
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub rect: Option<Rect>,
    #[serde(skip)]
    pub parent: Option<NodeId>,
    #[serde(skip)]
    pub children: Vec<NodeId>,
}

impl ElementNode {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            attrs: BTreeMap::new(),
            text: String::new(),
            rect: None,
            parent: None,
            children: Vec::new(),
        }
    }

    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.attrs.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.text = collapse_whitespace(text);
        self
    }

    pub fn with_rect(mut self, rect: Rect) -> Self {
        self.rect = Some(rect);
        self
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attrs.contains_key(name)
    }

    /// The raw `class` attribute, empty when absent.
    pub fn class_name(&self) -> &str {
        self.attr("class").unwrap_or("")
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.class_name().split_whitespace().any(|c| c == class)
    }

    pub fn is_heading(&self) -> bool {
        matches!(self.tag.as_str(), "h1" | "h2" | "h3" | "h4")
    }

    pub fn is_anchor(&self) -> bool {
        self.tag == "a"
    }

    pub fn href(&self) -> Option<&str> {
        self.attr("href")
    }
}

/// Node list as produced by an in-page serializer.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SerializedPage {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    title: String,
    nodes: Vec<SerializedNode>,
}

#[derive(Debug, Clone, Deserialize)]
struct SerializedNode {
    #[serde(flatten)]
    element: ElementNode,
    #[serde(default)]
    parent: Option<usize>,
}

/// Captured state of the host page's DOM.
#[derive(Debug, Clone, Default)]
pub struct PageSnapshot {
    url: Option<String>,
    title: String,
    nodes: Vec<ElementNode>,
    measured: bool,
}

impl PageSnapshot {
    /// Create an empty, measured snapshot. Nodes are appended with [`Self::append`].
    pub fn new(url: Option<&str>) -> Self {
        Self {
            url: url.map(str::to_string),
            title: String::new(),
            nodes: Vec::new(),
            measured: true,
        }
    }

    /// Parse static HTML. Static markup has no layout, so the snapshot is unmeasured.
    pub fn from_html(html: &str, url: Option<&str>) -> Self {
        let document = Html::parse_document(html);
        let mut page = Self::new(url);
        page.measured = false;
        page.ingest(document.root_element(), None);

        let title = page
            .iter()
            .find(|(_, n)| n.tag == "title")
            .map(|(_, n)| n.text.clone());
        if let Some(title) = title {
            page.title = title;
        }

        tracing::debug!("Parsed HTML snapshot with {} elements", page.len());
        page
    }

    /// Deserialize a node list produced by the in-page serializer.
    ///
    /// Nodes must be in document order; every `parent` index has to point
    /// at an earlier node.
    pub fn from_json(json: &str) -> LensResult<Self> {
        let serialized: SerializedPage = serde_json::from_str(json)?;
        let mut page = Self::new(serialized.url.as_deref());
        page.title = serialized.title;

        for (index, node) in serialized.nodes.into_iter().enumerate() {
            let parent = match node.parent {
                Some(p) if p >= index => {
                    return Err(LensError::Snapshot(format!(
                        "node {index} references parent {p} that does not precede it"
                    )));
                }
                Some(p) => Some(NodeId(p)),
                None => None,
            };
            page.append(parent, node.element);
        }

        page.measured = page.nodes.iter().any(|n| n.rect.is_some());
        Ok(page)
    }

    fn ingest(&mut self, element: ElementRef<'_>, parent: Option<NodeId>) {
        let value = element.value();
        let mut node = ElementNode::new(value.name());
        for (name, attr) in value.attrs() {
            node.attrs.insert(name.to_string(), attr.to_string());
        }

        let mut text = String::new();
        for child in element.children() {
            if let Node::Text(t) = child.value() {
                text.push_str(t);
                text.push(' ');
            }
        }
        node.text = collapse_whitespace(&text);

        let id = self.append(parent, node);
        for child in element.children() {
            if let Some(child_element) = ElementRef::wrap(child) {
                self.ingest(child_element, Some(id));
            }
        }
    }

    /// Append a node under `parent` (or as a root) and return its handle.
    pub fn append(&mut self, parent: Option<NodeId>, mut node: ElementNode) -> NodeId {
        let id = NodeId(self.nodes.len());
        node.parent = parent;
        node.children.clear();
        self.nodes.push(node);
        if let Some(p) = parent {
            if let Some(parent_node) = self.nodes.get_mut(p.0) {
                parent_node.children.push(id);
            }
        }
        id
    }

    pub fn set_title(&mut self, title: &str) {
        self.title = title.to_string();
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// Whether bounding boxes were captured with the snapshot.
    pub fn is_measured(&self) -> bool {
        self.measured
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Option<&ElementNode> {
        self.nodes.get(id.0)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        id.0 < self.nodes.len()
    }

    /// All nodes in insertion (document) order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &ElementNode)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).and_then(|n| n.parent)
    }

    /// Ancestors of `id`, nearest first, excluding `id` itself.
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = self.parent(id);
        while let Some(node) = current {
            out.push(node);
            current = self.parent(node);
        }
        out
    }

    /// Descendants of `id` in document order, excluding `id` itself.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = match self.node(id) {
            Some(n) => n.children.iter().rev().copied().collect(),
            None => return out,
        };
        while let Some(next) = stack.pop() {
            out.push(next);
            if let Some(n) = self.node(next) {
                stack.extend(n.children.iter().rev().copied());
            }
        }
        out
    }

    /// First descendant (document order) satisfying `pred`.
    pub fn find_descendant<F>(&self, id: NodeId, pred: F) -> Option<NodeId>
    where
        F: Fn(&ElementNode) -> bool,
    {
        self.descendants(id)
            .into_iter()
            .find(|d| self.node(*d).map(&pred).unwrap_or(false))
    }

    /// All descendants satisfying `pred`, in document order.
    pub fn find_descendants<F>(&self, id: NodeId, pred: F) -> Vec<NodeId>
    where
        F: Fn(&ElementNode) -> bool,
    {
        self.descendants(id)
            .into_iter()
            .filter(|d| self.node(*d).map(&pred).unwrap_or(false))
            .collect()
    }

    /// `id` itself or its nearest ancestor satisfying `pred`.
    pub fn closest<F>(&self, id: NodeId, pred: F) -> Option<NodeId>
    where
        F: Fn(&ElementNode) -> bool,
    {
        if self.node(id).map(&pred).unwrap_or(false) {
            return Some(id);
        }
        self.ancestors(id)
            .into_iter()
            .find(|a| self.node(*a).map(&pred).unwrap_or(false))
    }

    /// Every node in the snapshot satisfying `pred`.
    pub fn query_all<F>(&self, pred: F) -> Vec<NodeId>
    where
        F: Fn(&ElementNode) -> bool,
    {
        self.iter()
            .filter(|(_, n)| pred(n))
            .map(|(id, _)| id)
            .collect()
    }

    /// Node whose `id` attribute equals `element_id`.
    pub fn element_by_id(&self, element_id: &str) -> Option<NodeId> {
        self.iter()
            .find(|(_, n)| n.attr("id") == Some(element_id))
            .map(|(id, _)| id)
    }

    /// Text of the node and all of its descendants, whitespace-collapsed.
    pub fn text_content(&self, id: NodeId) -> String {
        let mut parts = Vec::new();
        if let Some(n) = self.node(id) {
            parts.push(n.text.as_str());
        }
        let descendants = self.descendants(id);
        for d in &descendants {
            if let Some(n) = self.node(*d) {
                parts.push(n.text.as_str());
            }
        }
        collapse_whitespace(&parts.join(" "))
    }

    /// Best guess at the search the user ran on this page.
    ///
    /// Tries the page URL's `query`/`q` parameter, then a search input's
    /// value, then a "search for …" pattern in the document title.
    pub fn extract_search_query(&self) -> Option<String> {
        if let Some(query) = self.url.as_deref().and_then(query_from_url) {
            tracing::debug!("Search query from URL: {query}");
            return Some(query);
        }

        let input = self.iter().find(|(_, n)| {
            n.tag == "input"
                && (n.attr("type") == Some("search")
                    || n.attr("placeholder").is_some_and(|p| p.contains("search"))
                    || n.attr("data-testid") == Some("search-input"))
        });
        if let Some(value) = input
            .and_then(|(_, n)| n.attr("value"))
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            tracing::debug!("Search query from input: {value}");
            return Some(value.to_string());
        }

        query_from_title(&self.title)
    }
}

fn query_from_url(page_url: &str) -> Option<String> {
    let parsed = url::Url::parse(page_url).ok()?;
    let pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
    ["query", "q"].iter().find_map(|key| {
        pairs
            .iter()
            .find(|(k, v)| k == key && !v.is_empty())
            .map(|(_, v)| v.clone())
    })
}

fn query_from_title(title: &str) -> Option<String> {
    let re = Regex::new(
        r#"(?i)search.*?["'“”]([^"'“”]+)["'“”]|search for (.+?) \||search results for (.+?)$"#,
    )
    .ok()?;
    let caps = re.captures(title)?;
    (1..=3)
        .find_map(|i| caps.get(i))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Nodes added to the document since the last pass.
///
/// The mutation carries the links of the added subtrees itself, so judging
/// it never depends on which snapshot the session currently holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomMutation {
    /// Node count of the added subtrees.
    #[serde(default)]
    pub added_nodes: usize,
    /// `href`s of every anchor at or below an added node.
    #[serde(default)]
    pub added_links: Vec<String>,
}

impl DomMutation {
    /// Describe `added` nodes of the snapshot that contains them.
    pub fn from_added(page: &PageSnapshot, added: &[NodeId]) -> Self {
        let mut added_nodes = 0;
        let mut added_links = Vec::new();
        for &id in added.iter().filter(|id| page.contains(**id)) {
            let subtree = std::iter::once(id).chain(page.descendants(id));
            for node in subtree.filter_map(|n| page.node(n)) {
                added_nodes += 1;
                if let Some(href) = node.href().filter(|_| node.is_anchor()) {
                    added_links.push(href.to_string());
                }
            }
        }
        Self {
            added_nodes,
            added_links,
        }
    }

    /// A mutation matters when an added subtree carries a tracked product link.
    pub fn is_relevant(&self) -> bool {
        self.added_links.iter().any(|href| is_tracked_href(href))
    }
}

fn is_tracked_href(href: &str) -> bool {
    MUTATION_PREFIXES.iter().any(|p| href.contains(p))
}

pub(crate) fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const HTML: &str = r#"
        <html><head><title>Search results for rust | Courses</title></head>
        <body>
          <div id="searchResults">
            <article class="result-card">
              <h3>  Rust   Basics </h3>
              <a href="/learn/rust-basics">Open</a>
            </article>
          </div>
        </body></html>"#;

    #[test]
    fn test_from_html_builds_tree() {
        let page = PageSnapshot::from_html(HTML, Some("https://example.org/search"));
        assert!(!page.is_measured());
        assert_eq!(page.title(), "Search results for rust | Courses");

        let results = page.element_by_id("searchResults").unwrap();
        let anchor = page.find_descendant(results, ElementNode::is_anchor).unwrap();
        assert_eq!(page.node(anchor).unwrap().href(), Some("/learn/rust-basics"));

        let article = page.closest(anchor, |n| n.tag == "article").unwrap();
        assert_eq!(page.text_content(article), "Rust Basics Open");
    }

    #[test]
    fn test_ancestors_nearest_first() {
        let mut page = PageSnapshot::new(None);
        let root = page.append(None, ElementNode::new("div"));
        let mid = page.append(Some(root), ElementNode::new("section"));
        let leaf = page.append(Some(mid), ElementNode::new("a"));
        assert_eq!(page.ancestors(leaf), vec![mid, root]);
        assert_eq!(page.descendants(root), vec![mid, leaf]);
    }

    #[test]
    fn test_from_json_rejects_forward_parent() {
        let json = r#"{"nodes":[{"tag":"div","parent":1},{"tag":"a"}]}"#;
        assert!(PageSnapshot::from_json(json).is_err());
    }

    #[test]
    fn test_from_json_with_rects() {
        let json = r#"{
            "url": "https://example.org/search?query=data%20science",
            "nodes": [
                {"tag": "div", "attrs": {"class": "card"}, "rect": {"x": 0, "y": 0, "width": 300, "height": 320}},
                {"tag": "a", "attrs": {"href": "/learn/ds"}, "text": "Data", "parent": 0}
            ]
        }"#;
        let page = PageSnapshot::from_json(json).unwrap();
        assert!(page.is_measured());
        assert_eq!(page.parent(NodeId(1)), Some(NodeId(0)));
        assert_eq!(page.extract_search_query().as_deref(), Some("data science"));
    }

    #[test]
    fn test_search_query_from_input_then_title() {
        let mut page = PageSnapshot::new(Some("https://example.org/browse"));
        page.set_title("Search for machine learning | Catalog");
        assert_eq!(page.extract_search_query().as_deref(), Some("machine learning"));

        page.append(
            None,
            ElementNode::new("input")
                .with_attr("type", "search")
                .with_attr("value", " python "),
        );
        assert_eq!(page.extract_search_query().as_deref(), Some("python"));
    }

    #[test]
    fn test_mutation_relevance() {
        let mut page = PageSnapshot::new(None);
        let body = page.append(None, ElementNode::new("body"));
        let banner = page.append(Some(body), ElementNode::new("div"));
        page.append(Some(banner), ElementNode::new("a").with_attr("href", "/about"));
        let list = page.append(Some(body), ElementNode::new("ul"));
        page.append(
            Some(list),
            ElementNode::new("a").with_attr("href", "/learn/python"),
        );

        assert!(!DomMutation::from_added(&page, &[banner]).is_relevant());

        let added = DomMutation::from_added(&page, &[list, NodeId(99)]);
        assert_eq!(added.added_nodes, 2);
        assert_eq!(added.added_links, vec!["/learn/python".to_string()]);
        assert!(added.is_relevant());
    }

    #[test]
    fn test_mutation_judged_without_snapshot() {
        let mutation: DomMutation = serde_json::from_str(
            r#"{"addedNodes": 3, "addedLinks": ["/browse/data-science", "/about"]}"#,
        )
        .unwrap();
        assert!(mutation.is_relevant());
        assert!(!DomMutation::default().is_relevant());
    }
}

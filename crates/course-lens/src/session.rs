//! Page-lifetime orchestration.
//!
//! A [`PageSession`] is the single writer of the accumulated responses and
//! the overlay set of one page view. It consumes [`LensEvent`]s, debounces
//! reprocessing, runs the extract → locate → correlate → present pipeline,
//! and drives enrichment through a [`Bridge`].
//!
//! Everything runs on one task. Bridge calls suspend the session, and any
//! outcome that arrives for a pass that has since been replaced is dropped
//! by the presenter.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

use crate::accumulator::ResponseStore;
use crate::cache::extract_cached_products;
use crate::correlator::{CorrelationContext, CorrelationReport, Correlator};
use crate::debounce::{
    earliest, sleep_until_deadline, Debouncer, MUTATION_QUIET, RESPONSE_QUIET, STARTUP_DELAY,
};
use crate::events::{EventBus, LensEvent};
use crate::extractor::{extract, ExtractSource};
use crate::interceptor::{InterceptingTransport, QueryRewriter, Transport, TransportKind};
use crate::locator::CardLocator;
use crate::messages::{Bridge, ExplanationResponse};
use crate::overlay::{EnrichmentTicket, MetricsSection, OverlayPresenter, FORMAT_DELAY, HIDE_GRACE};
use crate::page::PageSnapshot;
use crate::types::{LensResult, RequestMetadata, SearchResult};

/// Timer settings of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimings {
    pub response_quiet: Duration,
    pub mutation_quiet: Duration,
    pub startup_delay: Duration,
    pub hide_grace: Duration,
    pub format_delay: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            response_quiet: RESPONSE_QUIET,
            mutation_quiet: MUTATION_QUIET,
            startup_delay: STARTUP_DELAY,
            hide_grace: HIDE_GRACE,
            format_delay: FORMAT_DELAY,
        }
    }
}

/// A keyboard or popup command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Command {
    ToggleExtension,
    ToggleAi,
}

impl Command {
    /// Toast text shown after the command took effect.
    pub fn toast_message(self, enabled: bool) -> &'static str {
        match (self, enabled) {
            (Command::ToggleAi, true) => "AI explanations enabled",
            (Command::ToggleAi, false) => "AI explanations disabled",
            (Command::ToggleExtension, true) => "Extension enabled",
            (Command::ToggleExtension, false) => "Extension disabled",
        }
    }
}

/// A key press with its modifiers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeyChord {
    pub key: String,
    #[serde(default)]
    pub alt: bool,
    #[serde(default)]
    pub ctrl: bool,
}

impl KeyChord {
    pub fn new(key: &str, alt: bool, ctrl: bool) -> Self {
        Self {
            key: key.to_string(),
            alt,
            ctrl,
        }
    }

    /// Alt+A toggles AI display; Alt+E and Ctrl+Alt+C toggle the extension.
    pub fn command(&self) -> Option<Command> {
        if self.ctrl && self.alt && self.key == "c" {
            return Some(Command::ToggleExtension);
        }
        if !self.alt {
            return None;
        }
        match self.key.to_lowercase().as_str() {
            "a" => Some(Command::ToggleAi),
            "e" => Some(Command::ToggleExtension),
            _ => None,
        }
    }
}

/// What a command changed.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    pub command: Command,
    pub enabled: bool,
    /// Enrichment fetches re-triggered by turning AI display back on.
    pub tickets: Vec<EnrichmentTicket>,
}

impl CommandOutcome {
    pub fn toast(&self) -> &'static str {
        self.command.toast_message(self.enabled)
    }
}

/// Result of one processing pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassSummary {
    pub generation: u64,
    pub report: CorrelationReport,
}

/// A finished bridge call, applied with [`PageSession::complete`].
#[derive(Debug)]
pub enum FetchOutcome {
    Enrichment {
        ticket: EnrichmentTicket,
        outcome: LensResult<ExplanationResponse>,
    },
    Metrics {
        generation: u64,
        index: usize,
        section: MetricsSection,
    },
}

/// A bridge call running off the event loop.
pub type Fetch = BoxFuture<'static, FetchOutcome>;

/// State and pipeline of one page view.
pub struct PageSession {
    store: ResponseStore,
    rewriter: Arc<QueryRewriter>,
    bus: EventBus,
    locator: CardLocator,
    correlator: Correlator,
    presenter: OverlayPresenter,
    bridge: Arc<dyn Bridge>,
    timings: SessionTimings,
    page: PageSnapshot,
    cache_state: Option<Value>,
    request: Option<RequestMetadata>,
    active: bool,
    metrics_available: bool,
    response_debounce: Debouncer,
    mutation_debounce: Debouncer,
    pending: Vec<(Instant, EnrichmentTicket)>,
    last_report: Option<CorrelationReport>,
}

impl PageSession {
    pub fn new(bridge: Arc<dyn Bridge>, bus: EventBus, timings: SessionTimings) -> Self {
        Self {
            store: ResponseStore::new(),
            rewriter: Arc::new(QueryRewriter::default()),
            bus,
            locator: CardLocator::default(),
            correlator: Correlator::default(),
            presenter: OverlayPresenter::new(timings.hide_grace),
            bridge,
            timings,
            page: PageSnapshot::default(),
            cache_state: None,
            request: None,
            active: true,
            metrics_available: false,
            response_debounce: Debouncer::new(timings.response_quiet),
            mutation_debounce: Debouncer::new(timings.mutation_quiet),
            pending: Vec::new(),
            last_report: None,
        }
    }

    pub fn with_locator(mut self, locator: CardLocator) -> Self {
        self.locator = locator;
        self
    }

    pub fn with_correlator(mut self, correlator: Correlator) -> Self {
        self.correlator = correlator;
        self
    }

    pub fn with_rewriter(mut self, rewriter: Arc<QueryRewriter>) -> Self {
        self.rewriter = rewriter;
        self
    }

    /// Wrap one of the page's HTTP entry points with this session's rewriter.
    pub fn intercept<T: Transport>(&self, inner: T, kind: TransportKind) -> InterceptingTransport<T> {
        InterceptingTransport::new(inner, kind, Arc::clone(&self.rewriter), self.bus.clone())
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn rewriter(&self) -> &QueryRewriter {
        &self.rewriter
    }

    pub fn store(&self) -> &ResponseStore {
        &self.store
    }

    pub fn presenter(&self) -> &OverlayPresenter {
        &self.presenter
    }

    pub fn page(&self) -> &PageSnapshot {
        &self.page
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn metrics_available(&self) -> bool {
        self.metrics_available
    }

    pub fn last_report(&self) -> Option<&CorrelationReport> {
        self.last_report.as_ref()
    }

    /// Next instant at which a debounced pass is due.
    pub fn next_pass_at(&self) -> Option<Instant> {
        earliest(
            self.response_debounce.deadline(),
            self.mutation_debounce.deadline(),
        )
    }

    pub fn set_page(&mut self, page: PageSnapshot) {
        self.page = page;
    }

    pub fn set_cache_state(&mut self, state: Value) {
        self.cache_state = Some(state);
    }

    pub fn set_request(&mut self, request: RequestMetadata) {
        self.request = Some(request);
    }

    /// Probe the metrics service and schedule the first pass.
    pub async fn start(&mut self, now: Instant) {
        self.check_health().await;
        self.response_debounce.arm_at(now + self.timings.startup_delay);
    }

    pub async fn check_health(&mut self) -> bool {
        self.metrics_available = match self.bridge.check_health().await {
            Ok(health) => health.success && health.healthy,
            Err(e) => {
                tracing::warn!("Health check failed: {e}");
                false
            }
        };
        tracing::info!(
            "Metrics service {}",
            if self.metrics_available { "available" } else { "unavailable" }
        );
        self.metrics_available
    }

    /// Apply one page event.
    pub fn handle_event(&mut self, event: LensEvent, now: Instant) {
        match event {
            LensEvent::ResponseIntercepted(response) => {
                if self.store.accept(&response) {
                    self.response_debounce.poke(now);
                }
            }
            LensEvent::RequestObserved(request) => self.set_request(request),
            LensEvent::CacheStateCaptured { state } => self.set_cache_state(state),
            LensEvent::DomChanged(mutation) => {
                if mutation.is_relevant() {
                    tracing::debug!("Relevant DOM change, {} nodes added", mutation.added_nodes);
                    self.mutation_debounce.poke(now);
                }
            }
            LensEvent::PointerEntered { index } => {
                if let Some(ticket) = self.pointer_enter(index) {
                    self.pending.push((now + self.timings.format_delay, ticket));
                }
            }
            LensEvent::PointerLeft { index } => self.presenter.pointer_leave(index, now),
            LensEvent::Command { command } => {
                let outcome = self.apply_command(command, now);
                tracing::info!("{}", outcome.toast());
                self.pending
                    .extend(outcome.tickets.into_iter().map(|t| (now, t)));
            }
            LensEvent::Navigated { url } => self.navigate(&url, now),
            LensEvent::BreakerTripped { reason } => {
                tracing::info!("Query rewriting is off for this page view: {reason}");
            }
            LensEvent::PassCompleted { .. } => {}
        }
    }

    /// Pointer entered card or panel `index`.
    pub fn pointer_enter(&mut self, index: usize) -> Option<EnrichmentTicket> {
        if !self.active {
            return None;
        }
        self.presenter.pointer_enter(index)
    }

    pub fn apply_command(&mut self, command: Command, now: Instant) -> CommandOutcome {
        match command {
            Command::ToggleAi => {
                let enabled = !self.presenter.ai_enabled();
                let tickets = self.presenter.set_ai_enabled(enabled);
                CommandOutcome {
                    command,
                    enabled,
                    tickets,
                }
            }
            Command::ToggleExtension => {
                self.active = !self.active;
                if self.active {
                    self.response_debounce.poke(now);
                } else {
                    self.presenter.teardown();
                    self.pending.clear();
                    self.response_debounce.cancel();
                    self.mutation_debounce.cancel();
                }
                CommandOutcome {
                    command,
                    enabled: self.active,
                    tickets: Vec::new(),
                }
            }
        }
    }

    /// Full navigation: drop everything tied to the previous page view.
    pub fn navigate(&mut self, url: &str, now: Instant) {
        tracing::info!("Navigated to {url}, resetting page state");
        self.store.reset();
        self.presenter.teardown();
        self.pending.clear();
        self.page = PageSnapshot::new(Some(url));
        self.cache_state = None;
        self.request = None;
        self.last_report = None;
        self.mutation_debounce.cancel();
        self.response_debounce.cancel();
        self.response_debounce.arm_at(now + self.timings.startup_delay);
    }

    /// Whether a debounced pass is due; consumes the deadline.
    pub fn pass_due(&mut self, now: Instant) -> bool {
        let response = self.response_debounce.fire(now);
        let mutation = self.mutation_debounce.fire(now);
        response || mutation
    }

    /// Results of the captured responses. The page is scraped only while
    /// nothing was captured; a captured response with zero products stays
    /// authoritative.
    fn results(&self) -> Vec<SearchResult> {
        match self.store.merged_view() {
            Some(view) => extract(ExtractSource::Response(&view)),
            None => {
                tracing::debug!("No captured responses, falling back to page extraction");
                extract(ExtractSource::Page(&self.page))
            }
        }
    }

    fn search_query(&self) -> Option<String> {
        self.request
            .as_ref()
            .map(|r| r.query.clone())
            .filter(|q| !q.is_empty())
            .or_else(|| self.page.extract_search_query())
    }

    /// Run one processing pass. Every old overlay is gone before the new set
    /// is built.
    pub fn reprocess(&mut self) -> Option<PassSummary> {
        if !self.active {
            tracing::debug!("Skipping pass, extension disabled");
            return None;
        }
        self.presenter.teardown();
        self.pending.clear();

        let results = self.results();
        let cards = self.locator.locate(&self.page);
        let cached = self
            .cache_state
            .as_ref()
            .map(extract_cached_products)
            .unwrap_or_default();
        let context = CorrelationContext {
            request: self.request.as_ref(),
            cached: &cached,
        };
        let matches = self.correlator.correlate(&cards, &results, &context);
        let report = CorrelationReport::from_matches(&matches, results.len());
        if !report.missing_ids.is_empty() {
            tracing::debug!("Unmatched card identifiers: {:?}", report.missing_ids);
        }

        let generation = self.presenter.rebuild(matches, self.search_query());
        tracing::info!(
            "Pass {generation}: {} cards, {} results, {} matched",
            report.cards,
            report.results,
            report.matched
        );
        self.bus.emit(LensEvent::PassCompleted {
            generation,
            cards: report.cards,
            matched: report.matched,
        });
        self.last_report = Some(report.clone());
        Some(PassSummary { generation, report })
    }

    /// Metrics lookups for every identified overlay of the current pass.
    /// Without a healthy metrics service the blocks are marked unavailable
    /// and nothing is fetched.
    pub fn metrics_fetches(&mut self) -> Vec<Fetch> {
        let generation = self.presenter.generation();
        if !self.metrics_available {
            for index in 0..self.presenter.len() {
                self.presenter
                    .set_metrics(generation, index, MetricsSection::Unavailable);
            }
            return Vec::new();
        }
        let Some(query) = self.search_query() else {
            return Vec::new();
        };

        self.presenter
            .overlays()
            .iter()
            .enumerate()
            .filter_map(|(index, overlay)| {
                let product_id = overlay.matched().card.identifier.as_ref()?.key().to_string();
                let bridge = Arc::clone(&self.bridge);
                let query = query.clone();
                Some(
                    async move {
                        let response = bridge.fetch_metrics(&query, &product_id).await;
                        FetchOutcome::Metrics {
                            generation,
                            index,
                            section: MetricsSection::from_response(&response),
                        }
                    }
                    .boxed(),
                )
            })
            .collect()
    }

    /// The `formatExplanation` call for one ticket.
    pub fn enrichment_fetch(&self, ticket: EnrichmentTicket) -> Fetch {
        let bridge = Arc::clone(&self.bridge);
        async move {
            let outcome = bridge
                .format_explanation(
                    ticket.explanation.clone(),
                    ticket.details.clone(),
                    &ticket.search_query,
                )
                .await;
            FetchOutcome::Enrichment { ticket, outcome }
        }
        .boxed()
    }

    /// Apply a finished fetch. Outcomes of an earlier pass are dropped.
    pub fn complete(&mut self, done: FetchOutcome) -> bool {
        match done {
            FetchOutcome::Enrichment { ticket, outcome } => {
                self.presenter.apply_enrichment(&ticket, outcome)
            }
            FetchOutcome::Metrics {
                generation,
                index,
                section,
            } => self.presenter.set_metrics(generation, index, section),
        }
    }

    /// Fill every overlay's metrics block for the current pass and wait for
    /// all lookups. Returns how many blocks were filled from a lookup.
    pub async fn load_metrics(&mut self) -> usize {
        let fetches = self.metrics_fetches();
        let mut applied = 0;
        for done in futures::future::join_all(fetches).await {
            if self.complete(done) {
                applied += 1;
            }
        }
        applied
    }

    /// Run one enrichment fetch and apply its outcome.
    pub async fn enrich(&mut self, ticket: EnrichmentTicket) -> bool {
        let done = self.enrichment_fetch(ticket).await;
        self.complete(done)
    }

    /// Remove and return the queued tickets whose delay has passed.
    pub fn take_due_tickets(&mut self, now: Instant) -> Vec<EnrichmentTicket> {
        let (due, later): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|(at, _)| *at <= now);
        self.pending = later;
        due.into_iter().map(|(_, ticket)| ticket).collect()
    }

    /// Run every queued enrichment whose delay has passed, one after another.
    pub async fn run_due_enrichments(&mut self, now: Instant) -> usize {
        let mut applied = 0;
        for ticket in self.take_due_tickets(now) {
            if self.enrich(ticket).await {
                applied += 1;
            }
        }
        applied
    }

    fn next_enrichment_at(&self) -> Option<Instant> {
        self.pending.iter().map(|(at, _)| *at).min()
    }

    /// Apply due hides.
    pub fn tick(&mut self, now: Instant) -> Vec<usize> {
        self.presenter.tick(now)
    }

    /// Event loop. Returns when the event bus closes.
    pub async fn run(
        &mut self,
        mut events: broadcast::Receiver<LensEvent>,
        mut pages: watch::Receiver<PageSnapshot>,
    ) {
        let mut pages_open = true;
        let mut in_flight: FuturesUnordered<Fetch> = FuturesUnordered::new();
        loop {
            for ticket in self.take_due_tickets(Instant::now()) {
                in_flight.push(self.enrichment_fetch(ticket));
            }
            let pass_at = self.next_pass_at();
            let hide_at = self.presenter.next_deadline();
            let enrich_at = self.next_enrichment_at();

            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) => self.handle_event(event, Instant::now()),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Session lagged, {skipped} events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("Event bus closed, session ending");
                        break;
                    }
                },
                changed = pages.changed(), if pages_open => match changed {
                    Ok(()) => {
                        let snapshot = pages.borrow_and_update().clone();
                        self.set_page(snapshot);
                    }
                    Err(_) => pages_open = false,
                },
                _ = sleep_until_deadline(pass_at) => {
                    if self.pass_due(Instant::now()) && self.reprocess().is_some() {
                        in_flight.extend(self.metrics_fetches());
                    }
                }
                _ = sleep_until_deadline(hide_at) => {
                    self.tick(Instant::now());
                }
                // Due tickets are started at the top of the loop.
                _ = sleep_until_deadline(enrich_at) => {}
                Some(done) = in_flight.next(), if !in_flight.is_empty() => {
                    self.complete(done);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{
        ExplanationRequest, HealthResponse, MetricsResponse, ProductDetails, Sections,
    };
    use crate::overlay::Enrichment;
    use crate::page::{DomMutation, ElementNode, NodeId, Rect};
    use crate::types::LensError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeBridge {
        healthy: bool,
        fail_format: bool,
        format_delay: Option<Duration>,
        metric_calls: Mutex<Vec<(String, String)>>,
        format_calls: Mutex<usize>,
    }

    #[async_trait]
    impl Bridge for FakeBridge {
        async fn check_health(&self) -> LensResult<HealthResponse> {
            Ok(HealthResponse {
                success: true,
                healthy: self.healthy,
                error: None,
            })
        }

        async fn fetch_metrics(&self, query: &str, product_id: &str) -> LensResult<MetricsResponse> {
            self.metric_calls
                .lock()
                .unwrap()
                .push((query.to_string(), product_id.to_string()));
            Ok(MetricsResponse {
                success: true,
                ..Default::default()
            })
        }

        async fn format_explanation(
            &self,
            _explanation: ExplanationRequest,
            _details: ProductDetails,
            _search_query: &str,
        ) -> LensResult<ExplanationResponse> {
            *self.format_calls.lock().unwrap() += 1;
            if let Some(delay) = self.format_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_format {
                return Err(LensError::Bridge("no receiver".to_string()));
            }
            Ok(ExplanationResponse {
                sections: Sections(vec![("📋 Summary".to_string(), "ok".to_string())]),
                cached: false,
                cache_type: None,
                fallback_mode: false,
                raw_response: None,
                query: None,
                product_id: None,
                error: false,
            })
        }
    }

    const SEARCH_URL: &str = "https://example.org/graphql?opname=Search";

    fn append_cards(page: &mut PageSnapshot, parent: NodeId, ids: &[&str]) {
        for (i, id) in ids.iter().enumerate() {
            let card = page.append(
                Some(parent),
                ElementNode::new("div")
                    .with_attr("class", "result-card")
                    .with_attr("data-click-value", &format!(r#"{{"objectID":"{id}"}}"#))
                    .with_rect(Rect::new(0.0, i as f64 * 400.0, 300.0, 300.0)),
            );
            page.append(Some(card), ElementNode::new("h3").with_text(id));
            page.append(
                Some(card),
                ElementNode::new("a").with_attr("href", &format!("/learn/{id}")),
            );
        }
    }

    fn page_with_cards(ids: &[&str]) -> PageSnapshot {
        let mut page = PageSnapshot::new(Some("https://example.org/search?query=rust"));
        let body = page.append(None, ElementNode::new("body"));
        append_cards(&mut page, body, ids);
        page
    }

    /// Cards inside the results container the page scraper reads.
    fn listed_page(ids: &[&str]) -> PageSnapshot {
        let mut page = PageSnapshot::new(Some("https://example.org/search?query=rust"));
        let body = page.append(None, ElementNode::new("body"));
        let list = page.append(
            Some(body),
            ElementNode::new("div").with_attr("id", crate::extractor::RESULTS_CONTAINER_ID),
        );
        append_cards(&mut page, list, ids);
        page
    }

    fn search_payload(ids: &[&str]) -> Value {
        let elements: Vec<Value> = ids
            .iter()
            .map(|id| json!({"__typename": "Search_ProductHit", "id": id, "name": id, "searchExplanation": {"s": 1}}))
            .collect();
        json!([{"data": {"SearchResult": {"search": [{"elements": elements}]}}}])
    }

    fn session(bridge: FakeBridge) -> PageSession {
        PageSession::new(Arc::new(bridge), EventBus::default(), SessionTimings::default())
    }

    #[test]
    fn test_key_chords() {
        assert_eq!(KeyChord::new("A", true, false).command(), Some(Command::ToggleAi));
        assert_eq!(KeyChord::new("e", true, false).command(), Some(Command::ToggleExtension));
        assert_eq!(KeyChord::new("c", true, true).command(), Some(Command::ToggleExtension));
        assert_eq!(KeyChord::new("C", true, true).command(), None);
        assert_eq!(KeyChord::new("a", false, false).command(), None);
        assert_eq!(Command::ToggleAi.toast_message(false), "AI explanations disabled");
    }

    #[tokio::test(start_paused = true)]
    async fn test_responses_debounce_into_one_pass() {
        let mut session = session(FakeBridge::default());
        session.set_page(page_with_cards(&["a", "b"]));

        let now = Instant::now();
        session.store.accept_payload(SEARCH_URL, search_payload(&["a"]));
        session.response_debounce.poke(now);
        tokio::time::advance(Duration::from_millis(600)).await;
        session.store.accept_payload(SEARCH_URL, search_payload(&["b"]));
        session.response_debounce.poke(Instant::now());

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(!session.pass_due(Instant::now()));
        tokio::time::advance(Duration::from_millis(400)).await;
        assert!(session.pass_due(Instant::now()));

        let summary = session.reprocess().unwrap();
        assert_eq!(summary.report.cards, 2);
        assert_eq!(summary.report.matched, 2);
    }

    #[tokio::test]
    async fn test_reprocess_tears_down_before_rebuild() {
        let mut session = session(FakeBridge::default());
        session.set_page(page_with_cards(&["a"]));
        session
            .store
            .accept_payload(SEARCH_URL, search_payload(&["a"]));

        let first = session.reprocess().unwrap().generation;
        let ticket = session.pointer_enter(0).unwrap();
        let second = session.reprocess().unwrap().generation;
        assert_eq!(second, first + 1);
        assert_eq!(session.presenter().len(), 1);

        // The fetch started in the first pass resolves after the second pass.
        assert!(!session.enrich(ticket).await);
        assert_eq!(
            session.presenter().overlay(0).unwrap().enrichment(),
            &Enrichment::Pending
        );
    }

    #[tokio::test]
    async fn test_extension_toggle_tears_down() {
        let mut session = session(FakeBridge::default());
        session.set_page(page_with_cards(&["a"]));
        session.reprocess();
        assert_eq!(session.presenter().len(), 1);

        let outcome = session.apply_command(Command::ToggleExtension, Instant::now());
        assert_eq!(outcome.toast(), "Extension disabled");
        assert!(session.presenter().is_empty());
        assert!(session.reprocess().is_none());
        assert!(session.pointer_enter(0).is_none());

        let outcome = session.apply_command(Command::ToggleExtension, Instant::now());
        assert!(outcome.enabled);
        assert!(session.next_pass_at().is_some());
    }

    #[tokio::test]
    async fn test_metrics_unavailable_without_health() {
        let mut session = session(FakeBridge::default());
        session.start(Instant::now()).await;
        assert!(!session.metrics_available());
        session.set_page(page_with_cards(&["a"]));
        session.reprocess();
        session.load_metrics().await;
        assert_eq!(
            session.presenter().overlay(0).unwrap().metrics(),
            Some(&MetricsSection::Unavailable)
        );
    }

    #[tokio::test]
    async fn test_metrics_use_detected_query() {
        let bridge = Arc::new(FakeBridge {
            healthy: true,
            ..Default::default()
        });
        let mut session =
            PageSession::new(bridge.clone(), EventBus::default(), SessionTimings::default());
        session.check_health().await;
        session.set_page(page_with_cards(&["course~a", "course~b"]));
        session.reprocess();

        assert_eq!(session.load_metrics().await, 2);
        let calls = bridge.metric_calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                ("rust".to_string(), "course~a".to_string()),
                ("rust".to_string(), "course~b".to_string())
            ]
        );
        assert_eq!(
            session.presenter().overlay(1).unwrap().metrics(),
            Some(&MetricsSection::NoData)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hover_schedules_enrichment_after_delay() {
        let bridge = Arc::new(FakeBridge::default());
        let mut session =
            PageSession::new(bridge.clone(), EventBus::default(), SessionTimings::default());
        session.set_page(page_with_cards(&["a"]));
        session
            .store
            .accept_payload(SEARCH_URL, search_payload(&["a"]));
        session.reprocess();

        let now = Instant::now();
        session.handle_event(LensEvent::PointerEntered { index: 0 }, now);
        assert_eq!(session.run_due_enrichments(now).await, 0);

        tokio::time::advance(FORMAT_DELAY).await;
        assert_eq!(session.run_due_enrichments(Instant::now()).await, 1);
        assert_eq!(*bridge.format_calls.lock().unwrap(), 1);
        assert!(matches!(
            session.presenter().overlay(0).unwrap().enrichment(),
            Enrichment::Ready(_)
        ));
    }

    #[tokio::test]
    async fn test_failed_enrichment_shows_dump() {
        let mut session = session(FakeBridge {
            fail_format: true,
            ..Default::default()
        });
        session.set_page(page_with_cards(&["a"]));
        session
            .store
            .accept_payload(SEARCH_URL, search_payload(&["a"]));
        session.reprocess();
        let ticket = session.pointer_enter(0).unwrap();
        assert!(session.enrich(ticket).await);
        assert!(matches!(
            session.presenter().overlay(0).unwrap().enrichment(),
            Enrichment::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_navigation_resets_page_state() {
        let mut session = session(FakeBridge::default());
        session
            .store
            .accept_payload(SEARCH_URL, search_payload(&["a"]));
        session.set_page(page_with_cards(&["a"]));
        session.reprocess();

        session.handle_event(
            LensEvent::Navigated {
                url: "https://example.org/search?query=go".to_string(),
            },
            Instant::now(),
        );
        assert!(session.store().is_empty());
        assert!(session.presenter().is_empty());
        assert!(session.page().is_empty());
        assert!(session.next_pass_at().is_some());
    }

    #[tokio::test]
    async fn test_irrelevant_mutation_ignored() {
        let mut session = session(FakeBridge::default());
        let mut page = PageSnapshot::new(None);
        let body = page.append(None, ElementNode::new("body"));
        let footer = page.append(Some(body), ElementNode::new("footer"));
        page.append(Some(footer), ElementNode::new("a").with_attr("href", "/about"));
        let mutation = DomMutation::from_added(&page, &[footer, NodeId(99)]);
        session.set_page(page);

        session.handle_event(LensEvent::DomChanged(mutation), Instant::now());
        assert!(session.next_pass_at().is_none());
    }

    #[tokio::test]
    async fn test_page_fallback_only_before_any_capture() {
        let mut session = session(FakeBridge::default());
        session.set_page(listed_page(&["course~a"]));
        let scraped = session.reprocess().unwrap();
        assert_eq!(scraped.report.results, 1);

        // An empty search response is an answer, not a reason to scrape.
        session.store.accept_payload(SEARCH_URL, search_payload(&[]));
        let captured = session.reprocess().unwrap();
        assert_eq!(captured.report.results, 0);
        assert_eq!(captured.report.matched, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_handles_events_during_slow_enrichment() {
        let bridge = Arc::new(FakeBridge {
            format_delay: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let bus = EventBus::default();
        let mut session = PageSession::new(bridge.clone(), bus.clone(), SessionTimings::default());
        session.set_page(page_with_cards(&["a"]));
        session.store.accept_payload(SEARCH_URL, search_payload(&["a"]));
        session.reprocess();

        let events = bus.subscribe();
        let (_pages_tx, pages) = watch::channel(PageSnapshot::default());
        bus.emit(LensEvent::PointerEntered { index: 0 });
        let sender = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(FORMAT_DELAY + Duration::from_secs(1)).await;
            sender.emit(LensEvent::PointerLeft { index: 0 });
        });

        let ended = tokio::time::timeout(Duration::from_secs(5), session.run(events, pages)).await;
        assert!(ended.is_err());

        let overlay = session.presenter().overlay(0).unwrap();
        assert_eq!(*bridge.format_calls.lock().unwrap(), 1);
        assert_eq!(overlay.enrichment(), &Enrichment::Loading);
        assert!(!overlay.visibility().is_visible());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutation_before_snapshot_triggers_pass() {
        let bus = EventBus::default();
        let mut session = PageSession::new(
            Arc::new(FakeBridge::default()),
            bus.clone(),
            SessionTimings::default(),
        );
        let events = bus.subscribe();
        let (pages_tx, pages) = watch::channel(PageSnapshot::default());

        let grown = page_with_cards(&["a"]);
        let added: Vec<NodeId> = grown
            .iter()
            .filter(|(_, n)| n.has_class("result-card"))
            .map(|(id, _)| id)
            .collect();
        bus.emit(LensEvent::DomChanged(DomMutation::from_added(&grown, &added)));
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = pages_tx.send(grown);
        });

        let _ = tokio::time::timeout(Duration::from_secs(3), session.run(events, pages)).await;

        let report = session.last_report().expect("a pass ran");
        assert_eq!(report.cards, 1);
        assert_eq!(
            session.presenter().overlay(0).unwrap().metrics(),
            Some(&MetricsSection::Unavailable)
        );
    }
}

//! Hover overlays.
//!
//! One [`Overlay`] per correlated card, owned by the [`OverlayPresenter`] for
//! a single processing pass. Overlays track their own visibility (with a
//! cancellable delayed hide), the enrichment fetched for them, and render to
//! self-contained HTML with inline styles.
//!
//! The presenter never performs I/O itself. Operations that need the bridge
//! hand back an [`EnrichmentTicket`]; the caller runs it and feeds the
//! outcome to [`OverlayPresenter::apply_enrichment`], which drops outcomes
//! whose pass has already been torn down.

use std::fmt::Write as _;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::messages::{
    CacheType, ExplanationRequest, ExplanationResponse, Metrics, MetricsResponse, ProductDetails,
};
use crate::page::Rect;
use crate::types::{Explanation, LensError, LensResult, Match, Provenance};

/// Delay between pointer-leave and hiding.
pub const HIDE_GRACE: Duration = Duration::from_millis(1000);
/// Delay between showing and requesting enrichment.
pub const FORMAT_DELAY: Duration = Duration::from_millis(200);
/// Fields shown in the local dump that replaces a failed enrichment.
pub const DUMP_FIELD_LIMIT: usize = 10;
/// Gap between card and panel, and minimum distance to the viewport edge.
pub const OVERLAY_MARGIN: f64 = 10.0;

const DUMP_STRING_LIMIT: usize = 50;

/// Visibility of one overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Hidden,
    Shown,
    PendingHide { deadline: Instant },
}

impl Visibility {
    pub fn is_visible(&self) -> bool {
        !matches!(self, Visibility::Hidden)
    }
}

/// State of the AI enrichment of one overlay.
#[derive(Debug, Clone, PartialEq)]
pub enum Enrichment {
    /// The match carries nothing to explain.
    NotApplicable,
    /// Not shown yet.
    Pending,
    /// Shown while AI display was off; fetched when it comes back on.
    Suppressed,
    Loading,
    Ready(ExplanationResponse),
    /// The collaborator failed; a local field dump is shown instead.
    Failed(String),
}

/// The metrics block of a panel.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricsSection {
    Available(Metrics),
    NoData,
    Unavailable,
}

impl MetricsSection {
    /// Interpret a metrics lookup.
    pub fn from_response(response: &LensResult<MetricsResponse>) -> Self {
        match response {
            Ok(r) if r.success => match &r.metrics {
                Some(m) => MetricsSection::Available(m.clone()),
                None => MetricsSection::NoData,
            },
            _ => MetricsSection::Unavailable,
        }
    }
}

/// Everything needed to run one `formatExplanation` call.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichmentTicket {
    pub generation: u64,
    pub index: usize,
    pub explanation: ExplanationRequest,
    pub details: ProductDetails,
    pub search_query: String,
}

/// A card's panel for one pass.
#[derive(Debug, Clone)]
pub struct Overlay {
    generation: u64,
    matched: Match,
    search_query: Option<String>,
    visibility: Visibility,
    explanation: Option<ExplanationRequest>,
    enrichment: Enrichment,
    metrics: Option<MetricsSection>,
}

impl Overlay {
    pub fn new(generation: u64, matched: Match, search_query: Option<String>) -> Self {
        let explanation = matched
            .result
            .as_ref()
            .and_then(|r| match &r.explanation {
                Explanation::Present(payload) => Some(ExplanationRequest::Raw(payload.clone())),
                Explanation::Empty => Some(ExplanationRequest::FallbackMode),
                Explanation::Absent => None,
            });
        let enrichment = if explanation.is_some() {
            Enrichment::Pending
        } else {
            Enrichment::NotApplicable
        };

        Self {
            generation,
            matched,
            search_query,
            visibility: Visibility::Hidden,
            explanation,
            enrichment,
            metrics: None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn matched(&self) -> &Match {
        &self.matched
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn enrichment(&self) -> &Enrichment {
        &self.enrichment
    }

    pub fn metrics(&self) -> Option<&MetricsSection> {
        self.metrics.as_ref()
    }

    pub fn set_metrics(&mut self, section: MetricsSection) {
        self.metrics = Some(section);
    }

    /// Pointer entered the card or the panel. Returns true when the panel
    /// became visible (as opposed to a pending hide being cancelled).
    pub fn pointer_enter(&mut self) -> bool {
        let was_hidden = self.visibility == Visibility::Hidden;
        self.visibility = Visibility::Shown;
        was_hidden
    }

    /// Pointer left the card or the panel; schedule the hide.
    pub fn pointer_leave(&mut self, now: Instant, grace: Duration) {
        if self.visibility.is_visible() {
            self.visibility = Visibility::PendingHide {
                deadline: now + grace,
            };
        }
    }

    /// Apply a due hide. Returns true when the panel was hidden.
    pub fn tick(&mut self, now: Instant) -> bool {
        match self.visibility {
            Visibility::PendingHide { deadline } if now >= deadline => {
                self.visibility = Visibility::Hidden;
                true
            }
            _ => false,
        }
    }

    fn ticket(&mut self, index: usize) -> Option<EnrichmentTicket> {
        let explanation = self.explanation.clone()?;
        let Some(search_query) = self.search_query.clone().filter(|q| !q.is_empty()) else {
            self.enrichment = Enrichment::Failed("no search query detected".to_string());
            return None;
        };
        self.enrichment = Enrichment::Loading;
        Some(EnrichmentTicket {
            generation: self.generation,
            index,
            explanation,
            details: ProductDetails::from_match(&self.matched),
            search_query,
        })
    }

    fn apply_enrichment(&mut self, outcome: LensResult<ExplanationResponse>) {
        self.enrichment = match outcome {
            Ok(response) if !response.error && !response.sections.is_empty() => {
                Enrichment::Ready(response)
            }
            Ok(_) => Enrichment::Failed("formatter returned an error".to_string()),
            Err(e) => Enrichment::Failed(e.to_string()),
        };
    }

    /// Render the panel as HTML.
    pub fn render_html(&self, ai_enabled: bool) -> LensResult<String> {
        let mut html = String::new();
        self.render_into(&mut html, ai_enabled)
            .map_err(|e| LensError::Render(format!("card {}: {e}", self.matched.index)))?;
        Ok(html)
    }

    fn render_into(&self, out: &mut String, ai_enabled: bool) -> std::fmt::Result {
        let card = &self.matched.card;
        write!(
            out,
            r#"<div class="course-lens-overlay" data-card-index="{}" style="{}">"#,
            self.matched.index, PANEL_STYLE
        )?;
        write!(
            out,
            r#"<div style="font-weight:600;font-size:13px;margin-bottom:4px;">{}</div>"#,
            escape_html(&card.display.title)
        )?;
        write!(
            out,
            r#"<div style="font-size:10px;color:#64748b;margin-bottom:12px;">{} · {} · ID: {}</div>"#,
            escape_html(&card.display.partner),
            escape_html(&card.display.rating),
            escape_html(card.product_id())
        )?;

        self.render_metrics(out)?;
        if ai_enabled {
            self.render_enrichment(out)?;
        }
        self.render_details(out)?;

        if let Some(request) = &self.matched.request {
            block(out, "#7c3aed", "🔍 Search Query", |out| {
                write!(out, "<strong>Query:</strong> {}", escape_html(&request.query))
            })?;
        }
        if let Some(cached) = &self.matched.cached {
            block(out, "#5b21b6", "💾 Client Cache", |out| {
                write!(
                    out,
                    "<div><strong>Entity:</strong> {}</div><div><strong>Partner:</strong> {}</div>",
                    escape_html(&cached.entity_type),
                    escape_html(&cached.partner_name)
                )
            })?;
        }
        if self.matched.is_bare() {
            block(out, "#d97706", "⚠️ No API Data Found", |out| {
                out.write_str("This card couldn't be matched with any API data")
            })?;
        }

        out.write_str("</div>")
    }

    fn render_metrics(&self, out: &mut String) -> std::fmt::Result {
        match &self.metrics {
            None => Ok(()),
            Some(MetricsSection::Available(m)) => {
                block(out, "#7c3aed", "📈 Metrics - Historical Performance", |out| {
                    let rows = [
                        ("👀 Viewers", fmt_count(m.viewers)),
                        ("🖱️ Clickers", fmt_count(m.clickers)),
                        ("📚 Enrollers", fmt_count(m.enrollers)),
                        ("💰 Paid Enrollers", fmt_count(m.paid_enrollers)),
                        ("🎯 CTR", fmt_rate(m.ctr)),
                        ("📈 Enrollment Rate", fmt_rate(m.enrollment_rate)),
                        ("💵 Paid Conversion Rate", fmt_rate(m.paid_conversion_rate)),
                    ];
                    for (label, value) in rows {
                        write!(
                            out,
                            r#"<div style="font-size:10px;"><span style="color:#64748b;">{label}</span> <strong>{value}</strong></div>"#
                        )?;
                    }
                    Ok(())
                })
            }
            Some(MetricsSection::NoData) => block(out, "#6b7280", "📈 Metrics - No Historical Data", |out| {
                out.write_str("No historical performance data found for this course")
            }),
            Some(MetricsSection::Unavailable) => {
                block(out, "#d97706", "📈 Metrics - API Unavailable", |out| {
                    out.write_str("Metrics service is not reachable.")
                })
            }
        }
    }

    fn render_enrichment(&self, out: &mut String) -> std::fmt::Result {
        let fallback = self
            .explanation
            .as_ref()
            .is_some_and(ExplanationRequest::is_fallback);
        let heading = if fallback {
            "🧠 AI Course Analysis"
        } else {
            "🧠 AI Search Explanation"
        };

        match &self.enrichment {
            Enrichment::Pending | Enrichment::Suppressed | Enrichment::Loading => {
                block(out, "#ea580c", heading, |out| {
                    out.write_str(r#"<div class="course-lens-loading">🤖 Analyzing with AI...</div>"#)
                })
            }
            Enrichment::Ready(response) => block(out, "#ea580c", heading, |out| {
                write!(out, r#"<div style="font-size:9px;">{}</div>"#, cache_badge(response))?;
                for (label, text) in response.sections.iter() {
                    if text.trim().is_empty() {
                        continue;
                    }
                    write!(
                        out,
                        r#"<div style="margin-top:8px;padding:8px;border-left:3px solid {};"><div style="font-weight:600;font-size:10px;">{}</div><div style="font-size:10px;">{}</div></div>"#,
                        section_color(label),
                        escape_html(label),
                        escape_html(text)
                    )?;
                }
                if response.fallback_mode {
                    out.write_str(
                        r#"<div style="font-size:9px;color:#b45309;margin-top:8px;">ℹ️ Analysis based on course metadata</div>"#,
                    )?;
                }
                Ok(())
            }),
            Enrichment::Failed(reason) => block(out, "#dc2626", "🧠 AI Explanation Unavailable", |out| {
                write!(
                    out,
                    r#"<div style="font-size:9px;color:#6b7280;margin-bottom:6px;">{}</div>"#,
                    escape_html(reason)
                )?;
                let raw = self.matched.result.as_ref().map(|r| &r.raw);
                for (key, value) in field_dump(raw.unwrap_or(&Value::Null), Some(DUMP_FIELD_LIMIT)) {
                    write!(out, "<div><strong>{}:</strong> {}</div>", escape_html(&key), escape_html(&value))?;
                }
                Ok(())
            }),
            Enrichment::NotApplicable => match &self.matched.result {
                None => block(out, "#dc2626", "🔍 Debug: No ResponseData Found", |out| {
                    out.write_str("No GraphQL response data available for this card")
                }),
                Some(result) => {
                    let (title, reason) = match result.provenance {
                        Provenance::PageExtracted => (
                            "🔍 Debug: Data from Page Extraction",
                            "This result was extracted from the page, which never carries an explanation.",
                        ),
                        Provenance::Accumulated => (
                            "🔍 Debug: Data from Infinite Scroll",
                            "This result came from a later page of results and carries no explanation.",
                        ),
                        _ if result.entity_type != crate::extractor::PRODUCT_HIT_TYPE => (
                            "🔍 Debug: Non-ProductHit Type",
                            "Explanations are only requested for product hits.",
                        ),
                        _ => (
                            "🔍 Debug: No searchExplanation Found",
                            "The explanation field is missing from this result.",
                        ),
                    };
                    block(out, "#dc2626", title, |out| out.write_str(reason))
                }
            },
        }
    }

    fn render_details(&self, out: &mut String) -> std::fmt::Result {
        let Some(result) = &self.matched.result else {
            return Ok(());
        };
        block(out, "#16a34a", "✅ Product Object Details", |out| {
            for (key, value) in field_dump(&result.raw, None) {
                write!(out, "<div><strong>{}:</strong> {}</div>", escape_html(&key), escape_html(&value))?;
            }
            write!(
                out,
                r#"<div style="font-size:9px;color:#64748b;margin-top:8px;"><strong>Found at:</strong> {}</div>"#,
                escape_html(&result.found_at)
            )
        })
    }
}

const PANEL_STYLE: &str = "position:fixed;z-index:10000;max-width:420px;padding:20px;border-radius:20px;\
background:rgba(255,255,255,0.98);color:#1e293b;font-size:12px;line-height:1.6;\
font-family:-apple-system,BlinkMacSystemFont,'Segoe UI',Roboto,sans-serif;";

fn block<F>(out: &mut String, accent: &str, title: &str, body: F) -> std::fmt::Result
where
    F: FnOnce(&mut String) -> std::fmt::Result,
{
    write!(
        out,
        r#"<div style="margin-bottom:12px;padding:12px;border-radius:10px;border-left:3px solid {accent};"><div style="font-weight:600;color:{accent};margin-bottom:8px;font-size:11px;">{}</div><div style="font-size:10px;color:#374151;">"#,
        escape_html(title)
    )?;
    body(out)?;
    out.write_str("</div></div>")
}

fn cache_badge(response: &ExplanationResponse) -> String {
    let source = match (response.cached, response.cache_type) {
        (true, Some(CacheType::Redis)) => "💾 Redis",
        (true, _) => "💾 Session",
        (false, _) => "✨ Fresh",
    };
    if response.fallback_mode {
        format!("{source} (Metadata)")
    } else {
        source.to_string()
    }
}

fn section_color(label: &str) -> &'static str {
    match label.chars().next() {
        Some('🎯') => "#16a34a",
        Some('🔍') => "#0d9488",
        Some('📚') => "#dc2626",
        Some('📈') => "#d97706",
        Some('💫') => "#7c3aed",
        _ => "#2563eb",
    }
}

fn fmt_count(value: Option<f64>) -> String {
    let Some(v) = value else {
        return "N/A".to_string();
    };
    let digits = format!("{:.0}", v.abs());
    let mut grouped = String::new();
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    if v < 0.0 {
        grouped.insert(0, '-');
    }
    grouped
}

fn fmt_rate(value: Option<f64>) -> String {
    value
        .map(|v| format!("{v:.2}%"))
        .unwrap_or_else(|| "N/A%".to_string())
}

/// Escape text for inclusion in HTML.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

/// `avgProductRating` → `Avg Product Rating`.
fn display_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for (i, c) in key.chars().enumerate() {
        if c.is_uppercase() && i > 0 {
            out.push(' ');
        }
        if i == 0 {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn display_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Array(items) if items.is_empty() => "[]".to_string(),
        Value::Array(items) if items[0].is_string() => {
            let shown: Vec<&str> = items.iter().take(3).filter_map(Value::as_str).collect();
            let more = if items.len() > 3 { "..." } else { "" };
            format!("[{}{more}]", shown.join(", "))
        }
        Value::Array(items) => format!("[{} items]", items.len()),
        Value::Object(obj) => format!("{{{} fields}}", obj.len()),
        Value::String(s) if s.chars().count() > DUMP_STRING_LIMIT => {
            let head: String = s.chars().take(DUMP_STRING_LIMIT).collect();
            format!("{head}...")
        }
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Human-readable key/value pairs of a raw hit, skipping internal and
/// explanation fields.
pub fn field_dump(raw: &Value, limit: Option<usize>) -> Vec<(String, String)> {
    let Some(obj) = raw.as_object() else {
        return Vec::new();
    };
    obj.iter()
        .filter(|(k, _)| !k.starts_with('_') && k.as_str() != crate::extractor::EXPLANATION_FIELD)
        .take(limit.unwrap_or(usize::MAX))
        .map(|(k, v)| (display_key(k), display_value(v)))
        .collect()
}

/// Viewport dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

/// Top-left corner for a panel next to `card`: to the right, flipped left
/// or pulled up when it would leave the viewport, then clamped to the margin.
pub fn position_overlay(card: Rect, overlay: Size, viewport: Size) -> (f64, f64) {
    let mut left = card.right() + OVERLAY_MARGIN;
    let mut top = card.y;

    if left + overlay.width > viewport.width {
        left = card.x - overlay.width - OVERLAY_MARGIN;
    }
    if top + overlay.height > viewport.height {
        top = (card.bottom() - overlay.height).max(OVERLAY_MARGIN);
    }

    left = left
        .min(viewport.width - overlay.width - OVERLAY_MARGIN)
        .max(OVERLAY_MARGIN);
    top = top
        .min(viewport.height - overlay.height - OVERLAY_MARGIN)
        .max(OVERLAY_MARGIN);
    (left, top)
}

/// The overlay set of the current pass plus the global AI display toggle.
#[derive(Debug)]
pub struct OverlayPresenter {
    generation: u64,
    overlays: Vec<Overlay>,
    ai_enabled: bool,
    grace: Duration,
}

impl OverlayPresenter {
    pub fn new(grace: Duration) -> Self {
        Self {
            generation: 0,
            overlays: Vec::new(),
            ai_enabled: true,
            grace,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn overlays(&self) -> &[Overlay] {
        &self.overlays
    }

    pub fn overlay(&self, index: usize) -> Option<&Overlay> {
        self.overlays.get(index)
    }

    pub fn len(&self) -> usize {
        self.overlays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overlays.is_empty()
    }

    pub fn ai_enabled(&self) -> bool {
        self.ai_enabled
    }

    /// Toggle indicator text.
    pub fn indicator_label(&self) -> &'static str {
        if self.ai_enabled {
            "🧠 AI ON"
        } else {
            "🧠 AI OFF"
        }
    }

    /// Remove every overlay of the current pass.
    pub fn teardown(&mut self) -> usize {
        let removed = self.overlays.len();
        self.overlays.clear();
        if removed > 0 {
            tracing::debug!("Tore down {removed} overlays");
        }
        removed
    }

    /// Tear down the old pass and build one overlay per match.
    pub fn rebuild(&mut self, matches: Vec<Match>, search_query: Option<String>) -> u64 {
        self.teardown();
        self.generation += 1;
        let generation = self.generation;
        self.overlays = matches
            .into_iter()
            .map(|m| Overlay::new(generation, m, search_query.clone()))
            .collect();
        tracing::info!(
            "Created {} overlays for pass {generation}",
            self.overlays.len()
        );
        generation
    }

    /// Pointer entered card or panel `index`. Returns a ticket when the
    /// first show should start an enrichment fetch.
    pub fn pointer_enter(&mut self, index: usize) -> Option<EnrichmentTicket> {
        let ai_enabled = self.ai_enabled;
        let overlay = self.overlays.get_mut(index)?;
        overlay.pointer_enter();
        if overlay.enrichment != Enrichment::Pending {
            return None;
        }
        if !ai_enabled {
            overlay.enrichment = Enrichment::Suppressed;
            return None;
        }
        overlay.ticket(index)
    }

    pub fn pointer_leave(&mut self, index: usize, now: Instant) {
        let grace = self.grace;
        if let Some(overlay) = self.overlays.get_mut(index) {
            overlay.pointer_leave(now, grace);
        }
    }

    /// Apply due hides; returns the indices that were hidden.
    pub fn tick(&mut self, now: Instant) -> Vec<usize> {
        self.overlays
            .iter_mut()
            .enumerate()
            .filter_map(|(i, o)| o.tick(now).then_some(i))
            .collect()
    }

    /// Earliest pending hide, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.overlays
            .iter()
            .filter_map(|o| match o.visibility {
                Visibility::PendingHide { deadline } => Some(deadline),
                _ => None,
            })
            .min()
    }

    /// Switch AI display. Turning it on returns tickets for fetches that were
    /// suppressed while it was off.
    pub fn set_ai_enabled(&mut self, enabled: bool) -> Vec<EnrichmentTicket> {
        self.ai_enabled = enabled;
        tracing::info!("AI explanations {}", if enabled { "enabled" } else { "disabled" });
        if !enabled {
            return Vec::new();
        }
        self.overlays
            .iter_mut()
            .enumerate()
            .filter(|(_, o)| o.enrichment == Enrichment::Suppressed)
            .filter_map(|(i, o)| o.ticket(i))
            .collect()
    }

    /// Apply an enrichment outcome. Outcomes from a torn-down pass are
    /// discarded; returns whether it was applied.
    pub fn apply_enrichment(
        &mut self,
        ticket: &EnrichmentTicket,
        outcome: LensResult<ExplanationResponse>,
    ) -> bool {
        if ticket.generation != self.generation {
            tracing::debug!(
                "Discarding stale enrichment for pass {} (current {})",
                ticket.generation,
                self.generation
            );
            return false;
        }
        match self.overlays.get_mut(ticket.index) {
            Some(overlay) if overlay.enrichment == Enrichment::Loading => {
                overlay.apply_enrichment(outcome);
                true
            }
            _ => false,
        }
    }

    pub fn set_metrics(&mut self, generation: u64, index: usize, section: MetricsSection) -> bool {
        if generation != self.generation {
            return false;
        }
        match self.overlays.get_mut(index) {
            Some(overlay) => {
                overlay.set_metrics(section);
                true
            }
            None => false,
        }
    }

    /// Render one panel. A failing panel renders a placeholder instead.
    pub fn render(&self, index: usize) -> Option<String> {
        let overlay = self.overlays.get(index)?;
        Some(overlay.render_html(self.ai_enabled).unwrap_or_else(|e| {
            tracing::warn!("Overlay render failed: {e}");
            format!(
                r#"<div class="course-lens-overlay" data-card-index="{index}" style="{PANEL_STYLE}">Panel unavailable</div>"#
            )
        }))
    }

    pub fn render_all(&self) -> Vec<String> {
        (0..self.overlays.len())
            .filter_map(|i| self.render(i))
            .collect()
    }
}

impl Default for OverlayPresenter {
    fn default() -> Self {
        Self::new(HIDE_GRACE)
    }
}

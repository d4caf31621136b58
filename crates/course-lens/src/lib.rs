//! Course Lens: search-result correlation engine for course search pages.

pub mod accumulator;
pub mod cache;
pub mod correlator;
pub mod debounce;
pub mod events;
pub mod extractor;
pub mod interceptor;
pub mod locator;
pub mod messages;
pub mod overlay;
pub mod page;
pub mod session;
pub mod types;

pub use accumulator::ResponseStore;
pub use cache::extract_cached_products;
pub use correlator::{Correlator, CorrelationContext, CorrelationReport, MatchStrategy};
pub use debounce::Debouncer;
pub use events::{EventBus, InterceptedResponse, LensEvent};
pub use extractor::{extract, extract_from_page, extract_from_response, ExtractSource};
pub use interceptor::{
    InterceptingTransport, Injection, InterceptorConfig, QueryRewriter, ReqwestTransport, Transport,
    TransportKind,
};
pub use locator::{CardLocator, LocatorConfig};
pub use messages::{Bridge, BridgeReply, BridgeRequest};
pub use overlay::{position_overlay, Overlay, OverlayPresenter};
pub use page::{DomMutation, ElementNode, NodeId, PageSnapshot, Rect};
pub use session::{Command, Fetch, FetchOutcome, KeyChord, PageSession, SessionTimings};
pub use types::*;

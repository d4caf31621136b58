//! Page event bus.
//!
//! The [`EventBus`] is a `tokio::sync::broadcast` channel carrying
//! [`LensEvent`] values. The interceptor publishes captured responses on it,
//! the session consumes them. When nobody is subscribed, events are dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::interceptor::TransportKind;
use crate::page::DomMutation;
use crate::session::Command;
use crate::types::RequestMetadata;

/// A response observed on the search endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterceptedResponse {
    pub url: String,
    pub payload: Value,
    pub transport: TransportKind,
    pub timestamp: DateTime<Utc>,
}

/// Every event the page side emits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LensEvent {
    /// The interceptor captured a search endpoint response.
    ResponseIntercepted(InterceptedResponse),
    /// An outgoing search request carried a query.
    RequestObserved(RequestMetadata),
    /// The page's client-side object cache was read.
    CacheStateCaptured { state: Value },
    /// Nodes were added to the document.
    DomChanged(DomMutation),
    /// Pointer entered a card or its panel.
    PointerEntered { index: usize },
    /// Pointer left a card or its panel.
    PointerLeft { index: usize },
    /// Full navigation to a new page view.
    Navigated { url: String },
    /// A keyboard or popup command.
    Command { command: Command },
    /// Query rewriting was switched off after a schema rejection.
    BreakerTripped { reason: String },
    /// A processing pass finished.
    PassCompleted {
        generation: u64,
        cards: usize,
        matched: usize,
    },
}

/// Broadcast bus shared by the interceptor and the session.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LensEvent>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers. Never waits; ignored if no subscribers.
    pub fn emit(&self, event: LensEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<LensEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

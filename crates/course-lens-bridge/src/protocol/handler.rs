//! Main request dispatcher: receives envelopes and routes them to the bridge.

use std::sync::Arc;

use serde_json::{json, Value};

use course_lens::Bridge;

use crate::types::*;

/// Dispatches incoming request envelopes to a [`Bridge`].
pub struct ProtocolHandler {
    bridge: Arc<dyn Bridge>,
}

impl ProtocolHandler {
    pub fn new(bridge: Arc<dyn Bridge>) -> Self {
        Self { bridge }
    }

    /// Handle one decoded JSON value. Always produces a reply.
    pub async fn handle_message(&self, msg: Value) -> Value {
        match Envelope::from_value(msg) {
            Ok(envelope) => self.handle_envelope(envelope).await,
            Err(e) => e.to_envelope(Value::Null),
        }
    }

    pub async fn handle_envelope(&self, envelope: Envelope) -> Value {
        let id = envelope.id.clone();
        match self.dispatch(envelope).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("Request failed: {e}");
                e.to_envelope(id)
            }
        }
    }

    async fn dispatch(&self, envelope: Envelope) -> BridgeResult<Value> {
        let id = envelope.id.clone();
        let action = envelope.action()?.to_string();
        match action.as_str() {
            PING => Ok(json!({"id": id, "success": true})),
            "checkHealthService" | "fetchMetrics" | "formatExplanation" => {
                let request = envelope.into_request()?;
                tracing::debug!(action = request.action(), "Dispatching request");
                let reply = self.bridge.handle(request).await?;
                reply_envelope(id, &reply)
            }
            _ => Err(BridgeError::UnknownAction(action)),
        }
    }
}

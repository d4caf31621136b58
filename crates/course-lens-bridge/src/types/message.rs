//! Request and reply envelopes.
//!
//! Every line the page sends is a JSON object with an `action` tag and an
//! optional `id`. The bridge echoes the `id` on the matching reply so the
//! page can pair concurrent requests with their answers.

use serde_json::{Map, Value};

use course_lens::{BridgeReply, BridgeRequest};

use super::error::{BridgeError, BridgeResult};

/// Liveness probe answered by the bridge itself.
pub const PING: &str = "ping";

/// A decoded request line.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub id: Value,
    body: Map<String, Value>,
}

impl Envelope {
    pub fn from_value(value: Value) -> BridgeResult<Self> {
        let Value::Object(mut body) = value else {
            return Err(BridgeError::InvalidRequest(
                "Expected a JSON object".to_string(),
            ));
        };
        let id = body.remove("id").unwrap_or(Value::Null);
        Ok(Self { id, body })
    }

    pub fn action(&self) -> BridgeResult<&str> {
        self.body
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::InvalidRequest("Missing action".to_string()))
    }

    /// Decode the body as a typed request.
    pub fn into_request(self) -> BridgeResult<BridgeRequest> {
        serde_json::from_value(Value::Object(self.body))
            .map_err(|e| BridgeError::InvalidParams(e.to_string()))
    }
}

/// Serialize `reply` with the request id attached.
pub fn reply_envelope(id: Value, reply: &BridgeReply) -> BridgeResult<Value> {
    let mut value = serde_json::to_value(reply)?;
    match value.as_object_mut() {
        Some(map) => {
            map.insert("id".to_string(), id);
            Ok(value)
        }
        None => Err(BridgeError::InternalError(
            "Reply did not serialize to an object".to_string(),
        )),
    }
}

//! Line codec for the page channel: one JSON envelope per line.

use serde_json::Value;

use crate::types::{BridgeError, BridgeResult, Envelope};

/// Longest request line accepted, in bytes. Explanation requests carry the
/// whole product record, so this is generous.
pub const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

/// Decode one request line. Blank lines (keep-alives) decode to `None`.
pub fn decode_line(line: &str, max_bytes: usize) -> BridgeResult<Option<Envelope>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.len() > max_bytes {
        return Err(BridgeError::LineTooLong {
            size: trimmed.len(),
            max: max_bytes,
        });
    }
    let value: Value =
        serde_json::from_str(trimmed).map_err(|e| BridgeError::ParseError(e.to_string()))?;
    Envelope::from_value(value).map(Some)
}

/// Encode a reply as a single line, newline included.
pub fn encode_reply(reply: &Value) -> BridgeResult<String> {
    let mut line = serde_json::to_string(reply)?;
    line.push('\n');
    Ok(line)
}

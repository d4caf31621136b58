//! Error types and error codes for the bridge.

use serde_json::{json, Value};

/// Error codes carried in error envelopes.
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const UNKNOWN_ACTION: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    /// An upstream service answered with a non-success status.
    pub const UPSTREAM_STATUS: i32 = -32850;
    /// An upstream service could not be reached.
    pub const UPSTREAM_UNREACHABLE: i32 = -32851;
    pub const CONFIG_ERROR: i32 = -32852;
}

/// All errors that can occur in the bridge.
#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request line of {size} bytes exceeds the {max} byte limit")]
    LineTooLong { size: usize, max: usize },

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    /// Rendered the way the page shows upstream failures.
    #[error("HTTP {status}: {reason}")]
    Status { status: u16, reason: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Completion error: {0}")]
    Completion(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    pub fn code(&self) -> i32 {
        use error_codes::*;
        match self {
            BridgeError::ParseError(_) | BridgeError::Json(_) => PARSE_ERROR,
            BridgeError::InvalidRequest(_) | BridgeError::LineTooLong { .. } => INVALID_REQUEST,
            BridgeError::UnknownAction(_) => UNKNOWN_ACTION,
            BridgeError::InvalidParams(_) => INVALID_PARAMS,
            BridgeError::InternalError(_) | BridgeError::Transport(_) | BridgeError::Io(_) => {
                INTERNAL_ERROR
            }
            BridgeError::Status { .. } | BridgeError::Completion(_) => UPSTREAM_STATUS,
            BridgeError::Http(_) => UPSTREAM_UNREACHABLE,
            BridgeError::Config(_) | BridgeError::Url(_) => CONFIG_ERROR,
        }
    }

    /// Build from a response status, using the canonical reason phrase.
    pub fn status(status: reqwest::StatusCode) -> Self {
        BridgeError::Status {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or_default().to_string(),
        }
    }

    /// The error envelope written back to the page for request `id`.
    pub fn to_envelope(&self, id: Value) -> Value {
        json!({
            "id": id,
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        })
    }
}

impl From<course_lens::LensError> for BridgeError {
    fn from(e: course_lens::LensError) -> Self {
        BridgeError::InternalError(e.to_string())
    }
}

impl From<BridgeError> for course_lens::LensError {
    fn from(e: BridgeError) -> Self {
        course_lens::LensError::Bridge(e.to_string())
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;

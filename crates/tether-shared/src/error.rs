use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured error returned by the remote service, either in an HTTP error
/// body or inside a realtime error envelope.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("API error {code}: {message}")]
pub struct ApiError {
    /// Machine-readable error code.
    pub code: i64,
    /// Human-readable description.
    pub message: String,
    /// HTTP status reported by the server, when present.
    #[serde(rename = "StatusCode", default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ApiError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status: None,
        }
    }
}

/// Failures while decoding a realtime frame.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed event: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Event has no type tag")]
    MissingType,

    #[error("Unsupported event type: {0}")]
    UnsupportedType(String),

    /// The server sent an error envelope instead of an event.
    #[error("Server error: {0}")]
    Server(ApiError),
}

use tether_shared::ApiError;
use thiserror::Error;

/// Transport-level failures reported by a websocket engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Connection attempt timed out")]
    ConnectTimeout,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection closed by peer (code {code}): {reason}")]
    Closed { code: u16, reason: String },

    #[error("No pong received in time")]
    PongTimeout,

    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Failures of the request/response API.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Api(ApiError),

    #[error("Invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
}

impl NetError {
    /// The structured server error, if the request got that far.
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            NetError::Api(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, NetError>;

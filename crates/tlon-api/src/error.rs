use thiserror::Error;

/// Errors produced while talking to the ship.
#[derive(Error, Debug)]
pub enum ApiError {
    /// The request got no answer within the configured bound.
    #[error("request timed out")]
    Timeout,

    /// The agent rejected the poke (nack).
    #[error("rejected by ship: {0}")]
    Rejected(String),

    /// The scry path does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unexpected HTTP status {status} for {path}")]
    Status { status: u16, path: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("authentication failed: {0}")]
    Auth(String),

    /// The event stream or the transport went away.
    #[error("connection closed")]
    Closed,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Protocol(#[from] tlon_shared::ProtocolError),
}

impl ApiError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::Closed | Self::Http(_) => true,
            Self::Status { status, .. } => *status >= 500,
            Self::Rejected(_)
            | Self::NotFound(_)
            | Self::Auth(_)
            | Self::Json(_)
            | Self::Protocol(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;

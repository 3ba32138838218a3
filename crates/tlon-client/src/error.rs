use thiserror::Error;

use tlon_api::ApiError;
use tlon_shared::constants::GENERIC_ERROR_MESSAGE;
use tlon_shared::{IdError, ProtocolError};
use tlon_store::StoreError;

/// Errors surfaced by the client to its callers.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Ship error: {0}")]
    Api(#[from] ApiError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Invalid identifier: {0}")]
    Id(#[from] IdError),

    /// Input rejected before anything was sent.
    #[error("Invalid input: {0}")]
    Invalid(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Composite actions collapse every failure into this one message.
    #[error("{0}")]
    Generic(String),
}

impl ClientError {
    pub fn generic() -> Self {
        Self::Generic(GENERIC_ERROR_MESSAGE.to_string())
    }

    /// The message a user should see.
    pub fn user_message(&self) -> String {
        match self {
            Self::Api(ApiError::Rejected(_)) => "The ship rejected this change".to_string(),
            Self::Api(e) if e.is_transient() => "Couldn't reach your ship".to_string(),
            Self::Invalid(msg) | Self::Generic(msg) => msg.clone(),
            Self::NotFound(what) => format!("{what} not found"),
            _ => GENERIC_ERROR_MESSAGE.to_string(),
        }
    }

    /// Whether the ship explicitly said no (as opposed to being unreachable).
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Api(ApiError::Rejected(_)))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ClientError>;

use thiserror::Error;

/// Malformed identifier strings.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("Invalid ship name: {0}")]
    InvalidShip(String),

    #[error("Invalid group id: {0}")]
    InvalidGroup(String),

    #[error("Invalid channel id: {0}")]
    InvalidChannel(String),

    #[error("Invalid post id: {0}")]
    InvalidPost(String),

    #[error("Invalid term (expected lowercase @tas): {0}")]
    InvalidTerm(String),
}

/// Failures decoding events and snapshots received from the ship.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Unknown mark {mark} from app {app}")]
    UnknownMark { app: String, mark: String },

    #[error("Malformed {what}: {source}")]
    Malformed {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Identifier error: {0}")]
    Id(#[from] IdError),
}

//! Error types for amplitude-relay-core

use thiserror::Error;

/// Main error type for the amplitude-relay-core library
///
/// None of these ever escape [`crate::EventRelay`]; the relay logs them and
/// degrades to "analytics disabled". They surface from the collaborators
/// (store, sink factory, config) and from event construction.
#[derive(Error, Debug)]
pub enum Error {
    /// Stored credential could not be read at startup
    #[error("credential unavailable: {0}")]
    CredentialUnavailable(String),

    /// Credential could not be written to the store
    #[error("failed to persist credential: {0}")]
    CredentialPersistFailure(String),

    /// Event rejected before reaching a sink
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Sink construction or delivery error
    #[error("sink error: {0}")]
    Sink(String),
}

/// Result type alias for amplitude-relay-core
pub type Result<T> = std::result::Result<T, Error>;

//! Session State Error Types
//!
//! Error taxonomy shared by the store, the reaper and the provider facade.

use thiserror::Error;

use crate::session::codec::{DecodeError, EncodeError};

/// Session state errors
#[derive(Error, Debug)]
pub enum SessionStateError {
    /// Invalid setup value. Fatal at initialization, never retried.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Argument rejected before reaching the backing store
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A record with the same application and session id already exists
    #[error("Duplicate session key: {0}")]
    DuplicateKey(String),

    /// Connectivity or protocol failure talking to the backing store
    #[error("Backing store error: {0}")]
    BackingStore(String),

    /// Stored payload bytes could not be decoded
    #[error("Malformed session payload: {0}")]
    Decode(#[from] DecodeError),

    /// Payload could not be encoded for storage
    #[error("Cannot encode session payload: {0}")]
    Encode(#[from] EncodeError),

    /// A claimed record carried an undecodable payload
    #[error("Malformed payload for session {id}: {source}")]
    CorruptSession {
        id: String,
        #[source]
        source: DecodeError,
    },

    /// No async runtime available to drive the expiration timer
    #[error("Runtime unavailable: {0}")]
    Runtime(String),
}

impl From<rusqlite::Error> for SessionStateError {
    fn from(err: rusqlite::Error) -> Self {
        SessionStateError::BackingStore(err.to_string())
    }
}

impl From<toml::de::Error> for SessionStateError {
    fn from(err: toml::de::Error) -> Self {
        SessionStateError::Configuration(err.to_string())
    }
}

impl From<SessionStateError> for String {
    fn from(err: SessionStateError) -> String {
        err.to_string()
    }
}

/// Result type alias for session state operations
pub type SessionResult<T> = Result<T, SessionStateError>;

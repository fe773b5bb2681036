use thiserror::Error;

use crate::broker::BrokerError;

/// Errors surfaced by sessions, transports and the transport manager.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration: malformed broker list, empty required fields,
    /// or an internally inconsistent failure decision.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A builder was finalized without a required element.
    #[error("missing required configuration: {0}")]
    MissingConfig(String),

    /// Every configured broker address was tried and none accepted a connection.
    #[error("connection failed: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<Error>>,
    },

    /// The broker at one address could not be reached. Retried by the
    /// initial connection policy.
    #[error("broker unreachable: {0}")]
    Unreachable(#[source] BrokerError),

    /// A channel operation failed in a way classified as worth retrying.
    /// Retried by the regular policy.
    #[error("recoverable broker failure: {0}")]
    Recoverable(#[source] BrokerError),

    /// The retry budget of a policy was spent; wraps the last failure.
    #[error("operation failed after {attempts} retries: {source}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        source: Box<Error>,
    },

    /// The broker rejected an operation and retrying would not help.
    #[error("broker protocol error: {0}")]
    Protocol(#[source] BrokerError),

    /// The object was torn down before the operation was attempted.
    #[error("{0} is disposed")]
    Disposed(&'static str),

    /// The caller mixed subscription kinds on one destination, subscribed
    /// twice, or otherwise misused the API.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A logical transport id could not be resolved or its kind has no factory.
    #[error("transport error: {0}")]
    Transport(String),

    /// Creating a named session failed.
    #[error("failed to create session {name} on transport {transport_id}: {source}")]
    Session {
        name: String,
        transport_id: String,
        #[source]
        source: Box<Error>,
    },

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// The innermost broker error, if this error was caused by one.
    pub fn broker_error(&self) -> Option<&BrokerError> {
        // ---
        match self {
            Error::Unreachable(err) | Error::Recoverable(err) | Error::Protocol(err) => Some(err),
            Error::RetriesExhausted { source, .. } | Error::Session { source, .. } => {
                source.broker_error()
            }
            Error::Connection {
                source: Some(source),
                ..
            } => source.broker_error(),
            _ => None,
        }
    }
}

/// Result type alias for messaging operations.
pub type Result<T> = std::result::Result<T, Error>;

//! Engine error types.

use rill_core::formats::SerdeError;
use rill_core::CoreError;
use thiserror::Error;

/// Errors produced by the NATS table engine.
#[derive(Debug, Error)]
pub enum NatsError {
    /// Invalid or missing engine settings; fatal to table creation.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No broker reachable, or the connection was lost.
    #[error("cannot connect to NATS: {0}")]
    ConnectionFailed(String),

    /// An insert had no unambiguous target subject.
    #[error("ambiguous write subject: {0}")]
    AmbiguousWriteSubject(String),

    /// Invalid arguments, such as publishing to a wildcard subject.
    #[error("bad arguments: {0}")]
    BadArguments(String),

    /// The query is not allowed in the engine's current state.
    #[error("query not allowed: {0}")]
    QueryNotAllowed(String),

    /// An internal invariant was violated.
    #[error("logical error: {0}")]
    Logical(String),

    /// Row encoding or decoding failed.
    #[error(transparent)]
    Serde(#[from] SerdeError),

    /// A host-database contract failed.
    #[error(transparent)]
    Core(#[from] CoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = NatsError::ConnectionFailed("nats://localhost:4222 unreachable".into());
        assert!(err.to_string().contains("cannot connect"));
        assert!(err.to_string().contains("4222"));
    }

    #[test]
    fn test_serde_transparent() {
        let err: NatsError = SerdeError::MalformedInput("bad json".into()).into();
        assert_eq!(err.to_string(), "malformed input: bad json");
    }
}

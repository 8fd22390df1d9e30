//! Error types for the multiplexing layer.

use std::io;
use thiserror::Error;

/// Errors affecting a whole connection.
///
/// Unlike [`CallError`], a `ConnectionError` is never private to one call:
/// when a connection fails, every request pending on it observes the same
/// error exactly once.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The connection to the peer could not be established.
    ///
    /// The registry hands out the in-progress connection to every caller;
    /// all of them see this error if the attempt fails.
    #[error("connection to {addr} could not be established")]
    EstablishFailed {
        /// The peer address the attempt was made against.
        addr: String,
    },

    /// The connection dropped while requests were still in flight.
    #[error("connection lost with requests in flight")]
    ConnectionLost,

    /// The connection was closed locally.
    #[error("connection closed")]
    Closed,

    /// An I/O operation on the underlying channel failed.
    #[error("i/o error: {0}")]
    Io(String),
}

impl From<io::Error> for ConnectionError {
    fn from(error: io::Error) -> Self {
        ConnectionError::Io(error.to_string())
    }
}

/// Errors observed by a single client operation.
///
/// None of these are retried inside the core; retry policy belongs to the
/// caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The underlying connection failed before a reply arrived.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// The deadline elapsed before a reply arrived.
    ///
    /// The pending-table entry for the request is evicted when this is
    /// returned, so a late reply cannot resolve an abandoned caller.
    #[error("request timed out waiting for a reply")]
    Timeout,

    /// The reply was empty or did not match what a response must carry.
    #[error("invalid message: {reason}")]
    InvalidMessage {
        /// What was wrong with the reply.
        reason: String,
    },

    /// The peer answered with an error envelope instead of a reply.
    #[error("remote error: {message}")]
    Remote {
        /// Error text carried by the error envelope.
        message: String,
    },

    /// A pending entry already exists for this message id.
    ///
    /// This indicates an id-allocation defect, not a runtime condition.
    #[error("message id {id} already has a pending entry")]
    DuplicateMessageId {
        /// The colliding message id.
        id: u32,
    },

    /// The envelope could not be encoded for transmission.
    #[error("encode failed: {message}")]
    Encode {
        /// Details from the codec.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::EstablishFailed {
            addr: "10.0.0.1:9000".to_string(),
        };
        assert!(err.to_string().contains("10.0.0.1:9000"));
        assert_eq!(ConnectionError::Closed.to_string(), "connection closed");
    }

    #[test]
    fn test_call_error_from_connection() {
        let err: CallError = ConnectionError::ConnectionLost.into();
        assert!(matches!(
            err,
            CallError::Connection(ConnectionError::ConnectionLost)
        ));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::other("boom");
        let err: ConnectionError = io_err.into();
        assert!(matches!(err, ConnectionError::Io(_)));
        assert!(err.to_string().contains("boom"));
    }
}

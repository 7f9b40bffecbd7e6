//! Error taxonomy shared by every layer of a session.
//!
//! Transport faults (socket errors, short reads, end-of-stream) never leave
//! the transport as raw `io::Error`s; they are normalized into
//! [`SessionError::NotConnected`] and the owning connection is torn down.

use std::io;

use thiserror::Error;

use crate::serializer::SerializerError;
use crate::sync::Trip;

/// Errors surfaced by connections, listeners and their helpers.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The operation requires an active connection, or a transport fault
    /// was reclassified as a disconnection.
    #[error("not connected")]
    NotConnected,

    /// A frame announced an invalid length or its payload was malformed.
    #[error("corrupt data: {0}")]
    CorruptData(String),

    /// A bounded wait expired.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The encryption handshake was violated or failed verification.
    #[error("end-to-end handshake fault: {0}")]
    HandshakeFault(String),

    /// Name resolution produced no usable address.
    #[error("unable to resolve host {0}")]
    UnresolvedHost(String),

    /// A host string could not be parsed as `host:port`.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The listener is closed.
    #[error("listener is not open")]
    NotListening,

    /// The caller's cancellation signal fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The resource was torn down before or during the operation.
    #[error("resource disposed")]
    Disposed,

    /// The operation is not valid in the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Establishing the outbound TCP connection failed.
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),

    /// Binding a listening socket failed.
    #[error("failed to bind: {0}")]
    Bind(#[source] io::Error),

    /// Payload (de)serialization failed.
    #[error(transparent)]
    Serialization(#[from] SerializerError),
}

impl SessionError {
    /// Whether this error indicates the connection went away rather than a
    /// protocol or caller-side failure.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, SessionError::NotConnected | SessionError::Disposed)
    }
}

impl From<Trip> for SessionError {
    fn from(trip: Trip) -> Self {
        match trip {
            Trip::Cancelled => SessionError::Cancelled,
            Trip::Disconnected => SessionError::NotConnected,
            Trip::Disposed => SessionError::Disposed,
            Trip::Closed => SessionError::NotListening,
            Trip::TimedOut => SessionError::Timeout("deadline"),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SessionError>;

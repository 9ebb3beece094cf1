//! Typed error definitions for the venue client.
//!
//! [`ClientError`] is what callers of the request/response API see.
//! [`DecodeError`] is internal to the read path: decoder failures never reach
//! a caller, they are logged and the frame is dropped.

use thiserror::Error;

/// Errors surfaced by client operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// No socket is currently open (connecting, disconnected, or never started).
    #[error("not connected")]
    NotConnected,

    /// Writing the frame to the socket failed.
    #[error("write error: {0}")]
    Write(String),

    /// No response arrived within the request timeout.
    #[error("request {ext_id} timed out")]
    Timeout { ext_id: String },

    /// The request was outstanding when the client was disposed.
    #[error("request {ext_id} cancelled: client disposed")]
    Cancelled { ext_id: String },

    /// The client has been disposed; no further operations are accepted.
    #[error("client disposed")]
    Disposed,

    /// A caller-supplied identifier is already awaiting a response.
    #[error("identifier {0} is already pending")]
    DuplicateId(String),

    /// `start()` was called on a client whose supervisor is already running.
    #[error("client already started")]
    AlreadyStarted,

    /// The raw send path was handed something other than a JSON object.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Configuration validation error.
    #[error("config error: {0}")]
    Config(String),
}

/// Reasons a single frame is dropped by the decoder.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The frame is not JSON, even after repair.
    #[error("parse error: {0}")]
    Parse(String),

    /// The frame is JSON but a required field is missing or malformed.
    #[error("shape error: {0}")]
    Shape(String),
}

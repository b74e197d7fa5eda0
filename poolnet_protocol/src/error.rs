//! Error types for the wire protocol.

use thiserror::Error;

/// Framing and payload errors. All of these describe a single bad frame; none
/// of them mean the connection itself is unusable.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Payload does not fit the five-digit length header.
    #[error("frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },

    /// Header probe did not start with the `MSG` tag or had no valid length.
    #[error("malformed frame header: {0:?}")]
    MalformedHeader(String),

    /// A read delivered more bytes than the decoder asked for.
    #[error("frame overflow: got {got} bytes, expected at most {expected}")]
    Overflow { got: usize, expected: usize },

    /// Header announced a zero-length payload.
    #[error("empty frame")]
    EmptyFrame,

    /// Payload was not valid UTF-8 JSON.
    #[error("invalid payload: {0}")]
    InvalidPayload(#[source] serde_json::Error),

    /// Payload was JSON but not an object.
    #[error("payload is not a JSON object")]
    NotAnObject,

    /// A connect reply carried no usable `connId`.
    #[error("connect reply has no usable connId")]
    MissingConnId,
}

/// Result type alias using ProtocolError.
pub type Result<T> = std::result::Result<T, ProtocolError>;

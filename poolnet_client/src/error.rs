//! Error types for the client session engine.

use poolnet_protocol::{PriorityChannel, ProtocolError};
use thiserror::Error;

/// Every failure a session operation or callback can report.
#[derive(Debug, Error)]
pub enum ClientError {
    /// `init`/`start` has not been called, or the session was disconnected.
    #[error("client is not started")]
    NotStarted,

    /// The session has no live relay connection.
    #[error("client is not connected")]
    NotConnected,

    #[error("client is already started")]
    AlreadyStarted,

    #[error("client is already connected")]
    AlreadyConnected,

    /// The previous connection dropped (stream EOF, liveness timeout) and its
    /// workers are still attached.
    #[error("previous connection was lost, call init before connecting again")]
    ConnectionLost,

    /// The main pool can only be left through `move_to_pool`.
    #[error("unable to leave pool {0:?}: it is the main pool, use move_to_pool instead")]
    LeaveMainPool(String),

    /// A newer request of the same control type replaced this one.
    #[error("request superseded by a newer request of the same kind")]
    Superseded,

    /// The session was torn down before the request completed.
    #[error("session disconnected")]
    Disconnected,

    #[error("{0} queue is full")]
    QueueFull(PriorityChannel),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("invalid config: {0}")]
    Config(#[source] serde_json::Error),
}

/// Result type alias using ClientError.
pub type Result<T> = std::result::Result<T, ClientError>;

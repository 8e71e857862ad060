//! Error types for the gateway.

use thiserror::Error;

use serde_json::Value;

use crate::envelope::{EnvelopeError, ErrorCode, Payload};
use crate::types::RequestId;

/// Errors returned by the operator API and server startup.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A message could not be encoded or decoded.
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    /// Listener I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A node identity was rejected.
    #[error("invalid node id: {0}")]
    InvalidNodeId(#[from] NodeIdError),

    /// A request id is already pending.
    #[error("request id {0} is already pending")]
    DuplicateRequestId(RequestId),

    /// The gateway has been shut down.
    #[error("gateway is shut down")]
    Shutdown,
}

/// Errors raised while writing to or closing a socket.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The connection is closed or being closed.
    #[error("connection closed")]
    Closed,

    /// The write did not complete within the configured timeout.
    #[error("write timed out")]
    WriteTimeout,

    /// WebSocket protocol failure.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
            WsError::Io(e) => TransportError::Io(e.to_string()),
            other => TransportError::WebSocket(other.to_string()),
        }
    }
}

/// Result of a fire-and-forget send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// The frame was written to a connection.
    Success,
    /// No route or connection resolves for the destination.
    UnknownClient,
    /// Every candidate connection failed the write and was evicted.
    TransmissionFailed,
}

impl SendResult {
    /// Whether the frame was written.
    pub fn is_success(&self) -> bool {
        matches!(self, SendResult::Success)
    }
}

/// Terminal outcome of a correlated send.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    /// The node answered with a response.
    Response(Payload),
    /// The node answered with an error.
    Error {
        /// Error code sent by the node.
        code: ErrorCode,
        /// Error description sent by the node.
        description: String,
        /// Error details sent by the node.
        details: Value,
    },
    /// No reply arrived before the deadline.
    Timeout,
    /// The caller cancelled the wait.
    Cancelled,
    /// No route or connection resolves for the destination.
    UnknownClient,
    /// Every candidate connection failed the write.
    TransmissionFailed,
    /// The request could not be sent for an unexpected reason.
    InternalError(String),
}

impl RequestOutcome {
    /// Whether the node answered with a response.
    pub fn is_response(&self) -> bool {
        matches!(self, RequestOutcome::Response(_))
    }

    /// The response payload, if any.
    pub fn response(&self) -> Option<&Payload> {
        match self {
            RequestOutcome::Response(payload) => Some(payload),
            _ => None,
        }
    }
}

impl From<SendResult> for RequestOutcome {
    fn from(result: SendResult) -> Self {
        match result {
            SendResult::UnknownClient => RequestOutcome::UnknownClient,
            SendResult::TransmissionFailed => RequestOutcome::TransmissionFailed,
            SendResult::Success => {
                RequestOutcome::InternalError("send succeeded without a reply".to_string())
            }
        }
    }
}

/// Errors related to node identity parsing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeIdError {
    /// The identity is empty.
    #[error("node id cannot be empty")]
    Empty,

    /// The identity exceeds the maximum length.
    #[error("node id too long: {len} characters (max {max})")]
    TooLong {
        /// Actual length in characters.
        len: usize,
        /// Maximum allowed length.
        max: usize,
    },

    /// The identity contains a forbidden character.
    #[error("node id contains invalid character {0:?}")]
    InvalidCharacter(char),
}

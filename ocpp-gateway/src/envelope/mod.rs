//! Uniform in-memory representation of wire messages.
//!
//! Three message kinds travel over a connection: requests, responses and
//! errors. Each exists as a JSON variant (WebSocket text frame) and a binary
//! variant (WebSocket binary frame) with identical correlation semantics.
//!
//! Encoding and decoding are pure functions. A frame that cannot be decoded
//! yields a [`DecodeFailure`] carrying the request id when it could be
//! recovered, so the caller can answer with an [`ErrorEnvelope`] instead of
//! dropping the connection.

mod binary;
mod json;

use std::fmt;

use serde_json::Value;

use crate::types::{NetworkPath, NetworkingMode, NodeId, RequestId};

/// Message type tag for requests.
pub const MESSAGE_TYPE_REQUEST: u8 = 2;
/// Message type tag for responses.
pub const MESSAGE_TYPE_RESPONSE: u8 = 3;
/// Message type tag for errors.
pub const MESSAGE_TYPE_ERROR: u8 = 4;

/// One encoded WebSocket data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Text frame carrying a JSON envelope.
    Text(String),
    /// Binary frame carrying a binary envelope.
    Binary(Vec<u8>),
}

impl Frame {
    /// Size of the frame body in bytes.
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(bytes) => bytes.len(),
        }
    }

    /// Whether the frame body is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Which of the two wire encodings a message uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireFormat {
    /// JSON array in a text frame.
    Json,
    /// Length-prefixed binary layout in a binary frame.
    Binary,
}

/// Message payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// JSON document.
    Json(Value),
    /// Raw bytes.
    Binary(Vec<u8>),
}

impl Payload {
    /// Wire format implied by this payload.
    pub fn format(&self) -> WireFormat {
        match self {
            Payload::Json(_) => WireFormat::Json,
            Payload::Binary(_) => WireFormat::Binary,
        }
    }

    /// The JSON document, if this is a JSON payload.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Binary(_) => None,
        }
    }

    /// The raw bytes, if this is a binary payload.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Json(_) => None,
            Payload::Binary(bytes) => Some(bytes),
        }
    }
}

/// OCPP-J error codes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Requested action is not known by the receiver.
    NotImplemented,
    /// Requested action is recognized but not supported.
    NotSupported,
    /// An internal error occurred while processing the action.
    InternalError,
    /// Payload for the action is incomplete.
    ProtocolError,
    /// A security issue prevented processing the action.
    SecurityError,
    /// Payload is syntactically incorrect.
    FormatViolation,
    /// A field contains an invalid value.
    PropertyConstraintViolation,
    /// A field violates occurrence constraints.
    OccurrenceConstraintViolation,
    /// A field violates data type constraints.
    TypeConstraintViolation,
    /// Any other error.
    GenericError,
    /// The message type number is not supported.
    MessageTypeNotSupported,
    /// Content of the call is not a valid RPC request.
    RpcFrameworkError,
    /// A code outside the known set, preserved verbatim.
    Other(String),
}

impl ErrorCode {
    /// Wire representation.
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::SecurityError => "SecurityError",
            ErrorCode::FormatViolation => "FormatViolation",
            ErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            ErrorCode::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            ErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
            ErrorCode::GenericError => "GenericError",
            ErrorCode::MessageTypeNotSupported => "MessageTypeNotSupported",
            ErrorCode::RpcFrameworkError => "RpcFrameworkError",
            ErrorCode::Other(code) => code,
        }
    }

    /// Parse a wire error code. Unknown codes are kept as [`ErrorCode::Other`].
    pub fn parse(code: &str) -> Self {
        match code {
            "NotImplemented" => ErrorCode::NotImplemented,
            "NotSupported" => ErrorCode::NotSupported,
            "InternalError" => ErrorCode::InternalError,
            "ProtocolError" => ErrorCode::ProtocolError,
            "SecurityError" => ErrorCode::SecurityError,
            // OCPP 1.6 spelling
            "FormatViolation" | "FormationViolation" => ErrorCode::FormatViolation,
            "PropertyConstraintViolation" => ErrorCode::PropertyConstraintViolation,
            "OccurrenceConstraintViolation" | "OccurenceConstraintViolation" => {
                ErrorCode::OccurrenceConstraintViolation
            }
            "TypeConstraintViolation" => ErrorCode::TypeConstraintViolation,
            "GenericError" => ErrorCode::GenericError,
            "MessageTypeNotSupported" => ErrorCode::MessageTypeNotSupported,
            "RpcFrameworkError" => ErrorCode::RpcFrameworkError,
            other => ErrorCode::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request for an action on a node.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    /// Correlation id.
    pub request_id: RequestId,
    /// Action name, e.g. `BootNotification`.
    pub action: String,
    /// Final destination; zero when addressed to the directly connected peer.
    pub destination: NodeId,
    /// Hops travelled so far.
    pub network_path: NetworkPath,
    /// Framing the request arrived with. Outbound framing is chosen per
    /// connection by the dispatcher.
    pub networking_mode: NetworkingMode,
    /// Request body.
    pub payload: Payload,
}

/// A successful reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    /// Correlation id of the request being answered.
    pub request_id: RequestId,
    /// Response body.
    pub payload: Payload,
}

/// A failed reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEnvelope {
    /// Correlation id of the request being answered.
    pub request_id: RequestId,
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub description: String,
    /// Additional details (an object, empty when absent).
    pub details: Value,
    /// Encoding to use on the wire.
    pub format: WireFormat,
}

impl ErrorEnvelope {
    /// Build an error reply with empty details.
    pub fn new(
        request_id: RequestId,
        code: ErrorCode,
        description: impl Into<String>,
        format: WireFormat,
    ) -> Self {
        Self {
            request_id,
            code,
            description: description.into(),
            details: Value::Object(Default::default()),
            format,
        }
    }

    /// Error reply for a frame that could not be decoded.
    pub fn from_decode_failure(failure: &DecodeFailure, format: WireFormat) -> Self {
        Self::new(
            failure.request_id.clone().unwrap_or_else(RequestId::unknown),
            ErrorCode::InternalError,
            failure.error.to_string(),
            format,
        )
    }
}

/// Any decoded message.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// A request.
    Request(RequestEnvelope),
    /// A successful reply.
    Response(ResponseEnvelope),
    /// A failed reply.
    Error(ErrorEnvelope),
}

impl Envelope {
    /// Correlation id of this message.
    pub fn request_id(&self) -> &RequestId {
        match self {
            Envelope::Request(r) => &r.request_id,
            Envelope::Response(r) => &r.request_id,
            Envelope::Error(e) => &e.request_id,
        }
    }

    /// Wire format of this message.
    pub fn format(&self) -> WireFormat {
        match self {
            Envelope::Request(r) => r.payload.format(),
            Envelope::Response(r) => r.payload.format(),
            Envelope::Error(e) => e.format,
        }
    }

    /// Encode for a connection using `mode` framing.
    ///
    /// `mode` only affects requests; replies have a single framing.
    ///
    /// # Errors
    ///
    /// Returns an error when the frame would exceed `max_frame_size` or a
    /// field cannot be represented in the binary layout.
    pub fn encode(&self, mode: NetworkingMode, max_frame_size: usize) -> Result<Frame, EnvelopeError> {
        let frame = match self.format() {
            WireFormat::Json => Frame::Text(json::encode(self, mode)?),
            WireFormat::Binary => Frame::Binary(binary::encode(self, mode)?),
        };
        if frame.len() > max_frame_size {
            return Err(EnvelopeError::FrameTooLarge {
                size: frame.len(),
                max: max_frame_size,
            });
        }
        Ok(frame)
    }
}

/// Decode a text frame.
///
/// # Errors
///
/// Returns a [`DecodeFailure`] describing why the frame is not a valid
/// JSON envelope.
pub fn decode_text(text: &str, max_frame_size: usize) -> Result<Envelope, DecodeFailure> {
    if text.len() > max_frame_size {
        return Err(DecodeFailure::new(
            None,
            EnvelopeError::FrameTooLarge {
                size: text.len(),
                max: max_frame_size,
            },
        ));
    }
    json::decode(text)
}

/// Decode a binary frame.
///
/// # Errors
///
/// Returns a [`DecodeFailure`] describing why the frame is not a valid
/// binary envelope.
pub fn decode_binary(bytes: &[u8], max_frame_size: usize) -> Result<Envelope, DecodeFailure> {
    if bytes.len() > max_frame_size {
        return Err(DecodeFailure::new(
            None,
            EnvelopeError::FrameTooLarge {
                size: bytes.len(),
                max: max_frame_size,
            },
        ));
    }
    binary::decode(bytes)
}

/// Structured codec error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    /// The text frame is not valid JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    /// The JSON document is not an array.
    #[error("message is not a JSON array")]
    NotAnArray,

    /// The message type field is missing or not a number.
    #[error("missing or invalid message type")]
    InvalidMessageType,

    /// The message type number is not 2, 3 or 4.
    #[error("unsupported message type {0}")]
    UnsupportedMessageType(u64),

    /// The array has the wrong number of elements for its message type.
    #[error("{kind} has {len} elements")]
    WrongLength {
        /// Message kind being decoded.
        kind: &'static str,
        /// Number of elements found.
        len: usize,
    },

    /// A field has the wrong type or an invalid value.
    #[error("invalid {field}: {reason}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// The binary frame ended early.
    #[error("truncated frame: need {needed} bytes, have {have}")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes available.
        have: usize,
    },

    /// The binary frame has bytes after the last field.
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    /// A string field exceeds the binary layout's u16 length prefix.
    #[error("{field} too long for binary framing: {len} bytes")]
    StringTooLong {
        /// Field name.
        field: &'static str,
        /// Length in bytes.
        len: usize,
    },

    /// The frame exceeds the configured maximum size.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Actual size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },
}

/// A decode error together with the request id, when it could be read.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{error}")]
pub struct DecodeFailure {
    /// Correlation id recovered from the frame, if any.
    pub request_id: Option<RequestId>,
    /// What went wrong.
    pub error: EnvelopeError,
}

impl DecodeFailure {
    pub(crate) fn new(request_id: Option<RequestId>, error: EnvelopeError) -> Self {
        Self { request_id, error }
    }
}

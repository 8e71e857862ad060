//! JSON array framing.
//!
//! ```text
//! [2, id, action, payload]                            request (standard)
//! [2, id, action, payload, destination, [hop, ...]]   request (networking extensions)
//! [3, id, payload]                                    response
//! [4, id, code, description, details]                 error
//! ```

use serde_json::{json, Value};

use super::{
    DecodeFailure, Envelope, EnvelopeError, ErrorCode, ErrorEnvelope, Payload, RequestEnvelope,
    ResponseEnvelope, WireFormat, MESSAGE_TYPE_ERROR, MESSAGE_TYPE_REQUEST,
    MESSAGE_TYPE_RESPONSE,
};
use crate::types::{NetworkPath, NetworkingMode, NodeId, RequestId, MAX_REQUEST_ID_LEN};

pub(super) fn encode(envelope: &Envelope, mode: NetworkingMode) -> Result<String, EnvelopeError> {
    let array = match envelope {
        Envelope::Request(request) => {
            let payload = json_payload(&request.payload)?;
            match mode {
                NetworkingMode::Standard => json!([
                    MESSAGE_TYPE_REQUEST,
                    request.request_id.as_str(),
                    request.action,
                    payload,
                ]),
                NetworkingMode::NetworkingExtensions => {
                    let hops: Vec<&str> = request
                        .network_path
                        .hops()
                        .iter()
                        .map(NodeId::as_str)
                        .collect();
                    json!([
                        MESSAGE_TYPE_REQUEST,
                        request.request_id.as_str(),
                        request.action,
                        payload,
                        request.destination.as_str(),
                        hops,
                    ])
                }
            }
        }
        Envelope::Response(response) => json!([
            MESSAGE_TYPE_RESPONSE,
            response.request_id.as_str(),
            json_payload(&response.payload)?,
        ]),
        Envelope::Error(error) => json!([
            MESSAGE_TYPE_ERROR,
            error.request_id.as_str(),
            error.code.as_str(),
            error.description,
            error.details,
        ]),
    };
    serde_json::to_string(&array).map_err(|e| EnvelopeError::InvalidJson(e.to_string()))
}

fn json_payload(payload: &Payload) -> Result<&Value, EnvelopeError> {
    payload.as_json().ok_or_else(|| EnvelopeError::InvalidField {
        field: "payload",
        reason: "binary payload in JSON frame".to_string(),
    })
}

pub(super) fn decode(text: &str) -> Result<Envelope, DecodeFailure> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| DecodeFailure::new(None, EnvelopeError::InvalidJson(e.to_string())))?;
    let Value::Array(items) = value else {
        return Err(DecodeFailure::new(None, EnvelopeError::NotAnArray));
    };

    // Recover the id first so every later failure can be answered.
    let request_id = items
        .get(1)
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty() && id.chars().count() <= MAX_REQUEST_ID_LEN)
        .map(RequestId::new);
    let fail = |error| DecodeFailure::new(request_id.clone(), error);

    let message_type = items
        .first()
        .and_then(Value::as_u64)
        .ok_or_else(|| fail(EnvelopeError::InvalidMessageType))?;

    let Some(id) = request_id.clone() else {
        return Err(fail(EnvelopeError::InvalidField {
            field: "request id",
            reason: format!("expected a string of 1 to {MAX_REQUEST_ID_LEN} characters"),
        }));
    };

    match message_type {
        t if t == u64::from(MESSAGE_TYPE_REQUEST) => decode_request(id, items).map_err(fail),
        t if t == u64::from(MESSAGE_TYPE_RESPONSE) => {
            if items.len() != 3 {
                return Err(fail(EnvelopeError::WrongLength {
                    kind: "response",
                    len: items.len(),
                }));
            }
            let payload = items.into_iter().nth(2).unwrap_or(Value::Null);
            Ok(Envelope::Response(ResponseEnvelope {
                request_id: id,
                payload: Payload::Json(payload),
            }))
        }
        t if t == u64::from(MESSAGE_TYPE_ERROR) => decode_error(id, items).map_err(fail),
        other => Err(fail(EnvelopeError::UnsupportedMessageType(other))),
    }
}

fn decode_request(request_id: RequestId, items: Vec<Value>) -> Result<Envelope, EnvelopeError> {
    let networking_mode = match items.len() {
        4 => NetworkingMode::Standard,
        6 => NetworkingMode::NetworkingExtensions,
        len => return Err(EnvelopeError::WrongLength { kind: "request", len }),
    };
    let mut items = items.into_iter().skip(2);

    let action = match items.next() {
        Some(Value::String(action)) if !action.is_empty() => action,
        _ => {
            return Err(EnvelopeError::InvalidField {
                field: "action",
                reason: "expected a non-empty string".to_string(),
            })
        }
    };
    let payload = items.next().unwrap_or(Value::Null);

    let (destination, network_path) = match networking_mode {
        NetworkingMode::Standard => (NodeId::zero(), NetworkPath::new()),
        NetworkingMode::NetworkingExtensions => {
            let destination = match items.next() {
                Some(Value::String(dest)) => {
                    NodeId::try_from(dest).map_err(|e| EnvelopeError::InvalidField {
                        field: "destination",
                        reason: e.to_string(),
                    })?
                }
                _ => {
                    return Err(EnvelopeError::InvalidField {
                        field: "destination",
                        reason: "expected a string".to_string(),
                    })
                }
            };
            let hops = match items.next() {
                Some(Value::Array(hops)) => hops,
                _ => {
                    return Err(EnvelopeError::InvalidField {
                        field: "network path",
                        reason: "expected an array".to_string(),
                    })
                }
            };
            let hops = hops
                .into_iter()
                .map(|hop| match hop {
                    Value::String(hop) => NodeId::parse(&hop).map_err(|e| e.to_string()),
                    _ => Err("hop is not a string".to_string()),
                })
                .collect::<Result<Vec<_>, _>>()
                .map_err(|reason| EnvelopeError::InvalidField {
                    field: "network path",
                    reason,
                })?;
            (destination, NetworkPath::from_hops(hops))
        }
    };

    Ok(Envelope::Request(RequestEnvelope {
        request_id,
        action,
        destination,
        network_path,
        networking_mode,
        payload: Payload::Json(payload),
    }))
}

fn decode_error(request_id: RequestId, items: Vec<Value>) -> Result<Envelope, EnvelopeError> {
    if !(4..=5).contains(&items.len()) {
        return Err(EnvelopeError::WrongLength {
            kind: "error",
            len: items.len(),
        });
    }
    let mut items = items.into_iter().skip(2);
    let code = match items.next() {
        Some(Value::String(code)) => ErrorCode::parse(&code),
        _ => {
            return Err(EnvelopeError::InvalidField {
                field: "error code",
                reason: "expected a string".to_string(),
            })
        }
    };
    let description = match items.next() {
        Some(Value::String(description)) => description,
        _ => {
            return Err(EnvelopeError::InvalidField {
                field: "error description",
                reason: "expected a string".to_string(),
            })
        }
    };
    let details = items
        .next()
        .unwrap_or_else(|| Value::Object(Default::default()));

    Ok(Envelope::Error(ErrorEnvelope {
        request_id,
        code,
        description,
        details,
        format: WireFormat::Json,
    }))
}

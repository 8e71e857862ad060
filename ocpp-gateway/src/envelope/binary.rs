//! Binary framing.
//!
//! All integers are little-endian. Strings carry a u16 byte length prefix,
//! payloads a u32 one.
//!
//! ```text
//! header:   [kind: u8][request id: str]
//! request:  header [mode: u8][action: str][destination: str][hops: u16][hop: str]* [payload]
//! response: header [payload]
//! error:    header [code: str][description: str][details: str (JSON)]
//! ```

use serde_json::Value;

use super::{
    DecodeFailure, Envelope, EnvelopeError, ErrorCode, ErrorEnvelope, Payload, RequestEnvelope,
    ResponseEnvelope, WireFormat, MESSAGE_TYPE_ERROR, MESSAGE_TYPE_REQUEST,
    MESSAGE_TYPE_RESPONSE,
};
use crate::types::{NetworkPath, NetworkingMode, NodeId, RequestId, MAX_REQUEST_ID_LEN};

pub(super) fn encode(envelope: &Envelope, mode: NetworkingMode) -> Result<Vec<u8>, EnvelopeError> {
    let mut buf = Vec::new();
    match envelope {
        Envelope::Request(request) => {
            buf.push(MESSAGE_TYPE_REQUEST);
            put_str(&mut buf, "request id", request.request_id.as_str())?;
            buf.push(mode.as_u8());
            put_str(&mut buf, "action", &request.action)?;
            match mode {
                NetworkingMode::Standard => {
                    put_str(&mut buf, "destination", "")?;
                    buf.extend_from_slice(&0u16.to_le_bytes());
                }
                NetworkingMode::NetworkingExtensions => {
                    put_str(&mut buf, "destination", request.destination.as_str())?;
                    let hops = request.network_path.hops();
                    let count = u16::try_from(hops.len()).map_err(|_| {
                        EnvelopeError::StringTooLong {
                            field: "network path",
                            len: hops.len(),
                        }
                    })?;
                    buf.extend_from_slice(&count.to_le_bytes());
                    for hop in hops {
                        put_str(&mut buf, "hop", hop.as_str())?;
                    }
                }
            }
            put_payload(&mut buf, &request.payload)?;
        }
        Envelope::Response(response) => {
            buf.push(MESSAGE_TYPE_RESPONSE);
            put_str(&mut buf, "request id", response.request_id.as_str())?;
            put_payload(&mut buf, &response.payload)?;
        }
        Envelope::Error(error) => {
            buf.push(MESSAGE_TYPE_ERROR);
            put_str(&mut buf, "request id", error.request_id.as_str())?;
            put_str(&mut buf, "error code", error.code.as_str())?;
            put_str(&mut buf, "error description", &error.description)?;
            let details = serde_json::to_string(&error.details)
                .map_err(|e| EnvelopeError::InvalidJson(e.to_string()))?;
            put_str(&mut buf, "error details", &details)?;
        }
    }
    Ok(buf)
}

fn put_str(buf: &mut Vec<u8>, field: &'static str, value: &str) -> Result<(), EnvelopeError> {
    let len = u16::try_from(value.len()).map_err(|_| EnvelopeError::StringTooLong {
        field,
        len: value.len(),
    })?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

fn put_payload(buf: &mut Vec<u8>, payload: &Payload) -> Result<(), EnvelopeError> {
    let bytes = payload.as_bytes().ok_or_else(|| EnvelopeError::InvalidField {
        field: "payload",
        reason: "JSON payload in binary frame".to_string(),
    })?;
    let len = u32::try_from(bytes.len()).map_err(|_| EnvelopeError::StringTooLong {
        field: "payload",
        len: bytes.len(),
    })?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

/// Cursor over a binary frame.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], EnvelopeError> {
        let have = self.buf.len() - self.pos;
        if have < n {
            return Err(EnvelopeError::Truncated { needed: n, have });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, EnvelopeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, EnvelopeError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32, EnvelopeError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn str(&mut self, field: &'static str) -> Result<String, EnvelopeError> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| EnvelopeError::InvalidField {
            field,
            reason: "not valid UTF-8".to_string(),
        })
    }

    fn payload(&mut self) -> Result<Vec<u8>, EnvelopeError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn finish(&self) -> Result<(), EnvelopeError> {
        match self.buf.len() - self.pos {
            0 => Ok(()),
            extra => Err(EnvelopeError::TrailingBytes(extra)),
        }
    }
}

pub(super) fn decode(bytes: &[u8]) -> Result<Envelope, DecodeFailure> {
    let mut reader = Reader::new(bytes);
    let kind = reader.u8().map_err(|e| DecodeFailure::new(None, e))?;
    let request_id = reader
        .str("request id")
        .map_err(|e| DecodeFailure::new(None, e))?;
    if request_id.is_empty() || request_id.chars().count() > MAX_REQUEST_ID_LEN {
        return Err(DecodeFailure::new(
            None,
            EnvelopeError::InvalidField {
                field: "request id",
                reason: format!("expected 1 to {MAX_REQUEST_ID_LEN} characters"),
            },
        ));
    }
    let request_id = RequestId::new(request_id);

    let body = match kind {
        MESSAGE_TYPE_REQUEST => decode_request(&mut reader, request_id.clone()),
        MESSAGE_TYPE_RESPONSE => reader.payload().map(|payload| {
            Envelope::Response(ResponseEnvelope {
                request_id: request_id.clone(),
                payload: Payload::Binary(payload),
            })
        }),
        MESSAGE_TYPE_ERROR => decode_error(&mut reader, request_id.clone()),
        other => Err(EnvelopeError::UnsupportedMessageType(u64::from(other))),
    };
    body.and_then(|envelope| reader.finish().map(|()| envelope))
        .map_err(|e| DecodeFailure::new(Some(request_id), e))
}

fn decode_request(reader: &mut Reader<'_>, request_id: RequestId) -> Result<Envelope, EnvelopeError> {
    let mode = reader.u8()?;
    let networking_mode =
        NetworkingMode::from_u8(mode).ok_or_else(|| EnvelopeError::InvalidField {
            field: "networking mode",
            reason: format!("unknown mode {mode}"),
        })?;
    let action = reader.str("action")?;
    if action.is_empty() {
        return Err(EnvelopeError::InvalidField {
            field: "action",
            reason: "empty".to_string(),
        });
    }
    let destination =
        NodeId::try_from(reader.str("destination")?).map_err(|e| EnvelopeError::InvalidField {
            field: "destination",
            reason: e.to_string(),
        })?;
    let hop_count = reader.u16()?;
    let mut hops = Vec::with_capacity(usize::from(hop_count));
    for _ in 0..hop_count {
        let hop = NodeId::parse(&reader.str("hop")?).map_err(|e| EnvelopeError::InvalidField {
            field: "network path",
            reason: e.to_string(),
        })?;
        hops.push(hop);
    }
    let payload = reader.payload()?;

    Ok(Envelope::Request(RequestEnvelope {
        request_id,
        action,
        destination,
        network_path: NetworkPath::from_hops(hops),
        networking_mode,
        payload: Payload::Binary(payload),
    }))
}

fn decode_error(reader: &mut Reader<'_>, request_id: RequestId) -> Result<Envelope, EnvelopeError> {
    let code = ErrorCode::parse(&reader.str("error code")?);
    let description = reader.str("error description")?;
    let details = reader.str("error details")?;
    let details = if details.is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_str(&details).map_err(|e| EnvelopeError::InvalidField {
            field: "error details",
            reason: e.to_string(),
        })?
    };
    Ok(Envelope::Error(ErrorEnvelope {
        request_id,
        code,
        description,
        details,
        format: WireFormat::Binary,
    }))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_response_layout() {
        let envelope = Envelope::Response(ResponseEnvelope {
            request_id: RequestId::new("ab"),
            payload: Payload::Binary(vec![0xde, 0xad]),
        });
        let bytes = encode(&envelope, NetworkingMode::Standard).expect("encode");
        assert_eq!(
            bytes,
            vec![3, 2, 0, b'a', b'b', 2, 0, 0, 0, 0xde, 0xad]
        );
        assert_eq!(decode(&bytes).expect("decode"), envelope);
    }

    #[test]
    fn test_request_through_hub_keeps_path() {
        let envelope = Envelope::Request(RequestEnvelope {
            request_id: RequestId::new("7"),
            action: "DataTransfer".to_string(),
            destination: NodeId::parse("CS9").expect("valid"),
            network_path: NetworkPath::from_hops(vec![NodeId::parse("hub").expect("valid")]),
            networking_mode: NetworkingMode::NetworkingExtensions,
            payload: Payload::Binary(b"blob".to_vec()),
        });
        let bytes = encode(&envelope, NetworkingMode::NetworkingExtensions).expect("encode");
        assert_eq!(decode(&bytes).expect("decode"), envelope);
    }

    #[test]
    fn test_standard_request_drops_destination() {
        let envelope = Envelope::Request(RequestEnvelope {
            request_id: RequestId::new("7"),
            action: "Reset".to_string(),
            destination: NodeId::parse("CS9").expect("valid"),
            network_path: NetworkPath::new(),
            networking_mode: NetworkingMode::Standard,
            payload: Payload::Binary(Vec::new()),
        });
        let bytes = encode(&envelope, NetworkingMode::Standard).expect("encode");
        let Envelope::Request(decoded) = decode(&bytes).expect("decode") else {
            panic!("expected request");
        };
        assert!(decoded.destination.is_zero());
    }

    #[test]
    fn test_error_details_are_json() {
        let envelope = Envelope::Error(ErrorEnvelope {
            request_id: RequestId::new("e"),
            code: ErrorCode::NotSupported,
            description: "nope".to_string(),
            details: json!({"reason": "x"}),
            format: WireFormat::Binary,
        });
        let bytes = encode(&envelope, NetworkingMode::Standard).expect("encode");
        assert_eq!(decode(&bytes).expect("decode"), envelope);
    }

    #[test]
    fn test_truncated_frame_reports_request_id() {
        // Response with id "ab" whose payload length claims 10 bytes.
        let bytes = [3, 2, 0, b'a', b'b', 10, 0, 0, 0, 1];
        let failure = decode(&bytes).expect_err("truncated");
        assert_eq!(failure.request_id, Some(RequestId::new("ab")));
        assert!(matches!(failure.error, EnvelopeError::Truncated { .. }));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let bytes = [3, 1, 0, b'a', 0, 0, 0, 0, 0xff];
        let failure = decode(&bytes).expect_err("trailing");
        assert_eq!(failure.error, EnvelopeError::TrailingBytes(1));
    }

    #[test]
    fn test_unknown_kind() {
        let failure = decode(&[9, 1, 0, b'z']).expect_err("kind");
        assert_eq!(failure.request_id, Some(RequestId::new("z")));
        assert_eq!(failure.error, EnvelopeError::UnsupportedMessageType(9));
    }

    #[test]
    fn test_empty_frame() {
        let failure = decode(&[]).expect_err("empty");
        assert!(failure.request_id.is_none());
    }
}

//! Positional-array frame codec.
//!
//! Frames travel as JSON arrays with no field names:
//!
//! ```text
//! outbound: [protocol, messageType, requestSequence, {"key": "value", ...}]
//! inbound:  [protocol, messageType, responseSequence, {dt?, data?, et?, msg?}]
//! ```
//!
//! Decoding turns the array into an [`InboundFrame`] straight away so nothing
//! past this module indexes into raw arrays.

use serde_json::{Map, Value};

use crate::MAX_FRAME_SIZE;
use crate::error::{ProtocolError, ProtocolResult};
use crate::types::{FrameBody, InboundFrame, OutboundFrame, Payload, json_type_name};

/// Encodes an outgoing call as frame text.
///
/// # Example
///
/// ```rust
/// use skylink_protocol::{encode_request, Payload};
///
/// let payload = Payload::new().with("parameter", "subscribe");
/// let text = encode_request(1, 1, 7, &payload).unwrap();
/// assert_eq!(text, r#"[1,1,7,{"parameter":"subscribe"}]"#);
/// ```
pub fn encode_request(
    protocol: u32,
    message_type: u32,
    sequence: u64,
    payload: &Payload,
) -> ProtocolResult<String> {
    let frame = OutboundFrame {
        protocol,
        message_type,
        sequence,
        payload: payload.clone(),
    };
    encode_outbound(&frame)
}

/// Encodes an [`OutboundFrame`].
pub fn encode_outbound(frame: &OutboundFrame) -> ProtocolResult<String> {
    let text = serde_json::to_string(frame)
        .map_err(|e| ProtocolError::encoding(format!("failed to serialize frame: {e}")))?;
    check_size(text.len())?;
    Ok(text)
}

/// Encodes an [`InboundFrame`], as a server would send it.
pub fn encode_frame(frame: &InboundFrame) -> ProtocolResult<String> {
    let text = serde_json::to_string(frame)?;
    check_size(text.len())?;
    Ok(text)
}

fn check_size(len: usize) -> ProtocolResult<()> {
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::encoding(format!(
            "frame too large: {len} bytes (max: {MAX_FRAME_SIZE})"
        )));
    }
    Ok(())
}

/// Decodes frame text into an [`InboundFrame`].
///
/// The array must hold at least four elements; extra trailing elements are
/// ignored. A `null` body is treated as an empty one. Frames that break the
/// `dt`/`et` exclusivity rule still decode; see [`InboundFrame::is_malformed`].
///
/// # Example
///
/// ```rust
/// use skylink_protocol::{decode_frame, FrameKind};
///
/// let frame = decode_frame(r#"[1,4,12,{"dt":"PARAMETER","data":{"id":"x"}}]"#).unwrap();
/// assert_eq!(frame.sequence, 12);
/// assert_eq!(frame.kind(), FrameKind::Data);
/// ```
pub fn decode_frame(text: &str) -> ProtocolResult<InboundFrame> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::decode(format!(
            "frame too large: {} bytes (max: {MAX_FRAME_SIZE})",
            text.len()
        )));
    }

    let value: Value = serde_json::from_str(text)
        .map_err(|e| ProtocolError::decode(format!("invalid JSON: {e}")))?;
    decode_value(value)
}

/// Decodes an already-parsed JSON value.
pub fn decode_value(value: Value) -> ProtocolResult<InboundFrame> {
    let Value::Array(mut items) = value else {
        return Err(ProtocolError::decode(format!(
            "expected an array, got {}",
            json_type_name(&value)
        )));
    };

    if items.len() < 4 {
        return Err(ProtocolError::decode(format!(
            "expected 4 elements, got {}",
            items.len()
        )));
    }

    let protocol = small_int(&items[0], "protocol")?;
    let message_type = small_int(&items[1], "messageType")?;
    let sequence = items[2].as_u64().ok_or_else(|| {
        ProtocolError::decode(format!(
            "sequence must be a non-negative integer, got {}",
            items[2]
        ))
    })?;

    let body = match items.swap_remove(3) {
        Value::Null => FrameBody::default(),
        Value::Object(fields) => decode_body(fields),
        other => {
            return Err(ProtocolError::decode(format!(
                "body must be an object, got {}",
                json_type_name(&other)
            )));
        }
    };

    Ok(InboundFrame {
        protocol,
        message_type,
        sequence,
        body,
    })
}

/// Builds a body without failing on field types. See [`FrameBody`].
fn decode_body(mut fields: Map<String, Value>) -> FrameBody {
    let mut coerced = false;
    let mut text = |name: &str| match fields.remove(name) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => {
            coerced = true;
            Some(other.to_string())
        }
    };
    let dt = text("dt");
    let et = text("et");
    let msg = text("msg");
    let data = fields.remove("data").filter(|v| !v.is_null());

    FrameBody {
        dt,
        data,
        et,
        msg,
        coerced,
    }
}

fn small_int(value: &Value, field: &str) -> ProtocolResult<u32> {
    value
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| {
            ProtocolError::decode(format!(
                "{field} must be a non-negative 32-bit integer, got {value}"
            ))
        })
}

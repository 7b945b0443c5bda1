//! Named records for the positional wire frames.
//!
//! The wire carries bare arrays; these types are what the rest of the
//! workspace works with once a frame has crossed the codec.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{ProtocolError, ProtocolResult};

/// Arguments of an outgoing call: string keys to string values.
///
/// Keys are kept sorted so the encoded text is stable, which also makes
/// the payload usable as part of a subscription identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(BTreeMap<String, String>);

impl Payload {
    /// Creates an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: add one argument.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Inserts an argument, returning the previous value for that key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    /// Returns the value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Iterates arguments in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of arguments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no arguments.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Converts a JSON object whose values are all strings.
    ///
    /// Anything else is a caller bug: arguments must be stringified before
    /// they reach the protocol layer.
    pub fn from_json(value: Value) -> ProtocolResult<Self> {
        let Value::Object(map) = value else {
            return Err(ProtocolError::encoding(format!(
                "payload must be an object, got {}",
                json_type_name(&value)
            )));
        };

        let mut payload = Self::new();
        for (key, value) in map {
            match value {
                Value::String(s) => {
                    payload.insert(key, s);
                }
                other => {
                    return Err(ProtocolError::encoding(format!(
                        "argument {key:?} is {}, expected a string",
                        json_type_name(&other)
                    )));
                }
            }
        }
        Ok(payload)
    }

    /// Converts any serializable value via [`Payload::from_json`].
    pub fn from_serializable<T: Serialize + ?Sized>(value: &T) -> ProtocolResult<Self> {
        let json = serde_json::to_value(value)
            .map_err(|e| ProtocolError::encoding(format!("payload is not serializable: {e}")))?;
        Self::from_json(json)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Payload {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl From<BTreeMap<String, String>> for Payload {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

/// Outgoing frame: `[protocol, messageType, requestSequence, payload]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    /// Logical channel.
    pub protocol: u32,
    /// Operation within the channel.
    pub message_type: u32,
    /// Correlation number, unique per protocol for the connection.
    pub sequence: u64,
    /// Call arguments.
    pub payload: Payload,
}

impl OutboundFrame {
    /// Creates a frame.
    pub fn new(protocol: u32, message_type: u32, sequence: u64, payload: Payload) -> Self {
        Self {
            protocol,
            message_type,
            sequence,
            payload,
        }
    }
}

impl Serialize for OutboundFrame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (
            self.protocol,
            self.message_type,
            self.sequence,
            &self.payload,
        )
            .serialize(serializer)
    }
}

/// Body of an inbound frame.
///
/// Exactly one of `dt`+`data` or `et`+`msg` should be set, or neither for a
/// bare acknowledgement. Unknown fields are ignored.
///
/// The decoder never rejects a body over the type of `dt`, `et` or `msg`:
/// a non-string value is kept as its JSON text and `coerced` is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameBody {
    /// Semantic type of `data`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dt: Option<String>,
    /// Opaque payload, expected to be an object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub et: Option<String>,
    /// Human-readable error message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    /// A text field arrived as some other JSON type.
    #[serde(skip)]
    pub coerced: bool,
}

/// What an inbound frame carries, by precedence: an error wins over data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// `dt`/`data` payload.
    Data,
    /// `et`/`msg` error envelope.
    Error,
    /// Neither: a bare acknowledgement.
    Ack,
}

/// Decoded inbound frame: `[protocol, messageType, responseSequence, body]`.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    /// Logical channel.
    pub protocol: u32,
    /// Operation within the channel.
    pub message_type: u32,
    /// Echoed request sequence for responses, running counter for events.
    pub sequence: u64,
    /// Frame body.
    pub body: FrameBody,
}

impl InboundFrame {
    /// Creates a data frame.
    pub fn data(
        protocol: u32,
        message_type: u32,
        sequence: u64,
        dt: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            protocol,
            message_type,
            sequence,
            body: FrameBody {
                dt: Some(dt.into()),
                data: Some(data),
                ..Default::default()
            },
        }
    }

    /// Creates an error frame.
    pub fn error(
        protocol: u32,
        message_type: u32,
        sequence: u64,
        et: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            protocol,
            message_type,
            sequence,
            body: FrameBody {
                et: Some(et.into()),
                msg: Some(msg.into()),
                ..Default::default()
            },
        }
    }

    /// Creates a bare acknowledgement.
    pub fn ack(protocol: u32, message_type: u32, sequence: u64) -> Self {
        Self {
            protocol,
            message_type,
            sequence,
            body: FrameBody::default(),
        }
    }

    /// Classifies the frame.
    pub fn kind(&self) -> FrameKind {
        if self.body.et.is_some() {
            FrameKind::Error
        } else if self.body.dt.is_some() {
            FrameKind::Data
        } else {
            FrameKind::Ack
        }
    }

    /// Returns true when the body breaks the `dt`/`et` exclusivity rule or
    /// one of its text fields had to be coerced.
    pub fn is_malformed(&self) -> bool {
        let body = &self.body;
        let has_data_side = body.dt.is_some() || body.data.is_some();
        let has_error_side = body.et.is_some() || body.msg.is_some();

        body.coerced
            || (has_data_side && has_error_side)
            || body.dt.is_some() != body.data.is_some()
            || body.et.is_some() != body.msg.is_some()
            || body.data.as_ref().is_some_and(|d| !d.is_object())
    }

    /// Returns the data object, if the frame carries one.
    pub fn data_object(&self) -> Option<&Map<String, Value>> {
        self.body.data.as_ref().and_then(Value::as_object)
    }
}

impl Serialize for InboundFrame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (self.protocol, self.message_type, self.sequence, &self.body).serialize(serializer)
    }
}

impl fmt::Display for InboundFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}, {}, {:?}]",
            self.protocol,
            self.message_type,
            self.sequence,
            self.kind()
        )
    }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

//! Values handed to callers: call replies, subscription events, identities.

use std::fmt;

use serde_json::Value;

use skylink_protocol::InboundFrame;

/// Successful response to a call.
///
/// A bare acknowledgement has neither `dt` nor `data`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reply {
    /// Semantic type of `data`.
    pub dt: Option<String>,
    /// Opaque response payload.
    pub data: Option<Value>,
    /// The frame broke the `dt`/`et` exclusivity rule.
    pub malformed: bool,
}

impl Reply {
    pub(crate) fn from_frame(frame: InboundFrame) -> Self {
        let malformed = frame.is_malformed();
        Self {
            dt: frame.body.dt,
            data: frame.body.data,
            malformed,
        }
    }

    /// Whether the server sent only an acknowledgement.
    pub fn is_ack(&self) -> bool {
        self.dt.is_none() && self.data.is_none()
    }
}

/// One unsolicited frame delivered to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Semantic type of `data`; the subscriber decides what it means.
    pub dt: String,
    /// Opaque payload.
    pub data: Value,
    /// Running counter from the frame's sequence slot.
    pub sequence: u64,
    /// The frame broke the `dt`/`et` exclusivity rule.
    pub malformed: bool,
}

impl Event {
    /// Builds an event from a frame with a `dt`. Returns `None` otherwise.
    pub(crate) fn from_frame(frame: &InboundFrame) -> Option<Self> {
        let dt = frame.body.dt.clone()?;
        Some(Self {
            dt,
            data: frame.body.data.clone().unwrap_or(Value::Null),
            sequence: frame.sequence,
            malformed: frame.is_malformed(),
        })
    }
}

/// Stable identity of a subscription, kept across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub(crate) u64);

impl SubscriptionId {
    /// Raw numeric id.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

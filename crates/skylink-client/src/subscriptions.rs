//! Long-lived event streams and their routing.
//!
//! A subscription is identified by `(protocol, messageType, resourceKey)`.
//! The key is taken from the subscribe payload, and an event is routed to a
//! subscription when the event's `data` carries the same key values.
//!
//! The server only ever sees one subscription per identity, called a stream.
//! Callers subscribing to an identity that is already streamed attach to the
//! existing stream as extra subscribers, and the unsubscribe goes out when
//! the last of them leaves.
//!
//! Events can legitimately arrive before the subscribe ack has been read.
//! Those are parked in a small per-stream buffer and replayed, in order,
//! once the ack resolves. A buffer that outlives the grace window is
//! discarded.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use skylink_protocol::Payload;

use crate::error::{ClientError, ClientResult};
use crate::message::{Event, SubscriptionId};

/// Identity of a subscription's target within its protocol and message type.
///
/// Holds the key fields of the subscribe payload, sorted by name. An empty
/// key matches every event of its protocol and message type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ResourceKey(Vec<(String, String)>);

impl ResourceKey {
    /// Builds a key from `payload`, keeping only `fields` (all when empty).
    pub fn from_payload(payload: &Payload, fields: &[String]) -> Self {
        let pairs = payload
            .iter()
            .filter(|(k, _)| fields.is_empty() || fields.iter().any(|f| f == k))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self(pairs)
    }

    /// Whether an event's `data` object carries every key field with the
    /// same value. Numbers and booleans compare by their JSON text.
    pub fn matches(&self, data: Option<&Map<String, Value>>) -> bool {
        if self.0.is_empty() {
            return true;
        }
        let Some(data) = data else {
            return false;
        };
        self.0.iter().all(|(field, expected)| match data.get(field) {
            Some(Value::String(s)) => s == expected,
            Some(v @ (Value::Number(_) | Value::Bool(_))) => v.to_string() == *expected,
            _ => false,
        })
    }

    /// Key fields in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Whether the key matches everything.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("*");
        }
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{k}={v}")?;
        }
        Ok(())
    }
}

/// One server-side subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct StreamId(u64);

impl StreamId {
    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// Where and how a stream is subscribed on the server.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Target {
    pub protocol: u32,
    pub message_type: u32,
    pub unsubscribe_type: u32,
    pub payload: Payload,
    pub key: ResourceKey,
}

type Identity = (u32, u32, ResourceKey);

impl Target {
    fn identity(&self) -> Identity {
        (self.protocol, self.message_type, self.key.clone())
    }
}

/// A subscribe or unsubscribe frame the engine has to send for a stream.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StreamFrame {
    pub stream: StreamId,
    pub protocol: u32,
    pub message_type: u32,
    pub payload: Payload,
}

/// One caller attached to a stream.
#[derive(Debug)]
pub(crate) struct Subscriber {
    id: SubscriptionId,
    events: mpsc::Sender<ClientResult<Event>>,
    ack: Option<oneshot::Sender<ClientResult<()>>>,
    delivered: u64,
}

impl Subscriber {
    pub fn new(
        id: SubscriptionId,
        events: mpsc::Sender<ClientResult<Event>>,
        ack: oneshot::Sender<ClientResult<()>>,
    ) -> Self {
        Self {
            id,
            events,
            ack: Some(ack),
            delivered: 0,
        }
    }

    /// Pushes one item to the subscriber. Returns false when the receiver
    /// has gone away.
    fn deliver(&mut self, item: ClientResult<Event>) -> bool {
        match self.events.try_send(item) {
            Ok(()) => {
                self.delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(subscription = %self.id, "event channel full, dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Completes a waiting ack. Returns false when nobody was listening.
    fn confirm(&mut self) -> bool {
        match self.ack.take() {
            Some(ack) => ack.send(Ok(())).is_ok(),
            None => true,
        }
    }

    /// Hands a failure to the ack waiter, or to the event stream once the
    /// ack has been consumed.
    fn fail(mut self, error: ClientError) {
        match self.ack.take() {
            Some(ack) => {
                let _ = ack.send(Err(error));
            }
            None => {
                self.deliver(Err(error));
            }
        }
    }
}

#[derive(Debug)]
enum SubState {
    /// Waiting for the (re)subscribe ack.
    Pending {
        early: VecDeque<Event>,
        first_buffered: Option<Instant>,
    },
    /// Acknowledged; events flow straight through.
    Active,
}

impl SubState {
    fn pending() -> Self {
        Self::Pending {
            early: VecDeque::new(),
            first_buffered: None,
        }
    }
}

#[derive(Debug)]
struct Stream {
    id: StreamId,
    target: Target,
    state: SubState,
    subscribers: Vec<Subscriber>,
}

impl Stream {
    fn is_active(&self) -> bool {
        matches!(self.state, SubState::Active)
    }

    fn subscribe_frame(&self) -> StreamFrame {
        StreamFrame {
            stream: self.id,
            protocol: self.target.protocol,
            message_type: self.target.message_type,
            payload: self.target.payload.clone(),
        }
    }

    fn unsubscribe_frame(&self) -> StreamFrame {
        StreamFrame {
            stream: self.id,
            protocol: self.target.protocol,
            message_type: self.target.unsubscribe_type,
            payload: self.target.payload.clone(),
        }
    }

    /// Delivers to every subscriber, collecting those whose receiver is gone.
    fn fan_out(&mut self, event: &Event, abandoned: &mut Vec<SubscriptionId>) {
        for sub in &mut self.subscribers {
            if !sub.deliver(Ok(event.clone())) {
                abandoned.push(sub.id);
            }
        }
    }
}

/// A subscriber removed from its stream.
#[derive(Debug)]
pub(crate) struct Removed {
    pub key: ResourceKey,
    pub delivered: u64,
    /// Set when the subscriber was the last one on its stream.
    pub unsubscribe: Option<StreamFrame>,
}

/// What to send after a subscribe ack timed out.
#[derive(Debug)]
pub(crate) struct AckTimeout {
    /// Withdraws whatever the server may have set up.
    pub unsubscribe: StreamFrame,
    /// Subscribers that were already live keep the stream; ask again.
    pub retry: Option<StreamFrame>,
}

/// Registry of streams and the subscribers attached to them.
#[derive(Debug)]
pub(crate) struct SubscriptionRegistry {
    streams: BTreeMap<StreamId, Stream>,
    by_identity: HashMap<Identity, StreamId>,
    owners: HashMap<SubscriptionId, StreamId>,
    next_stream: u64,
    early_capacity: usize,
    abandoned: Vec<SubscriptionId>,
}

impl SubscriptionRegistry {
    pub fn new(early_capacity: usize) -> Self {
        Self {
            streams: BTreeMap::new(),
            by_identity: HashMap::new(),
            owners: HashMap::new(),
            next_stream: 1,
            early_capacity,
            abandoned: Vec::new(),
        }
    }

    /// Attaches a subscriber to the stream for `target`, opening one if
    /// needed. Returns the subscribe frame when a new stream was opened.
    ///
    /// Joining a stream that is already active acks right away; joining a
    /// pending one waits for that stream's ack.
    pub fn join(&mut self, target: Target, mut subscriber: Subscriber) -> Option<StreamFrame> {
        if let Some(&stream_id) = self.by_identity.get(&target.identity()) {
            if let Some(stream) = self.streams.get_mut(&stream_id) {
                if stream.target.payload != target.payload {
                    debug!(
                        stream = %stream_id,
                        key = %target.key,
                        "payload differs outside the key, sharing the existing stream"
                    );
                }
                debug!(
                    subscription = %subscriber.id,
                    stream = %stream_id,
                    subscribers = stream.subscribers.len() + 1,
                    "joined existing stream"
                );
                if stream.is_active() && !subscriber.confirm() {
                    self.abandoned.push(subscriber.id);
                }
                self.owners.insert(subscriber.id, stream_id);
                stream.subscribers.push(subscriber);
                return None;
            }
        }

        let id = StreamId(self.next_stream);
        self.next_stream += 1;
        debug!(
            subscription = %subscriber.id,
            stream = %id,
            protocol = target.protocol,
            message_type = target.message_type,
            key = %target.key,
            "subscription registered"
        );
        self.by_identity.insert(target.identity(), id);
        self.owners.insert(subscriber.id, id);
        let stream = Stream {
            id,
            target,
            state: SubState::pending(),
            subscribers: vec![subscriber],
        };
        let frame = stream.subscribe_frame();
        self.streams.insert(id, stream);
        Some(frame)
    }

    /// Number of subscribers across all streams.
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    /// Number of server-side streams.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Applies the result of a (re)subscribe call.
    ///
    /// Success activates the stream and replays early events in arrival
    /// order to every subscriber. Failure removes the stream and hands the
    /// error to each subscriber: its ack waiter if it has not been acked
    /// yet, otherwise its event stream.
    pub fn acknowledge(&mut self, id: StreamId, outcome: ClientResult<()>) {
        if let Err(error) = outcome {
            let Some(stream) = self.take_stream(id) else {
                debug!(stream = %id, "subscribe failure for a stream that no longer exists");
                return;
            };
            warn!(stream = %id, key = %stream.target.key, error = %error, "subscribe failed");
            for sub in stream.subscribers {
                sub.fail(error.duplicate());
            }
            return;
        }

        let Some(stream) = self.streams.get_mut(&id) else {
            debug!(stream = %id, "ack for a stream that no longer exists");
            return;
        };
        let previous = std::mem::replace(&mut stream.state, SubState::Active);
        for sub in &mut stream.subscribers {
            if !sub.confirm() {
                debug!(subscription = %sub.id, "subscriber stopped waiting for the ack");
                self.abandoned.push(sub.id);
            }
        }
        if let SubState::Pending { early, .. } = previous {
            if !early.is_empty() {
                debug!(stream = %id, count = early.len(), "replaying early events");
            }
            for event in &early {
                stream.fan_out(event, &mut self.abandoned);
            }
        }
        info!(
            stream = %id,
            key = %stream.target.key,
            subscribers = stream.subscribers.len(),
            "subscription active"
        );
    }

    /// Handles a subscribe ack that never came.
    ///
    /// Subscribers still waiting for their first ack get `error` and leave.
    /// Subscribers that were already live keep the stream pending so it can
    /// be asked for again.
    pub fn ack_timed_out(&mut self, id: StreamId, error: ClientError) -> Option<AckTimeout> {
        let stream = self.streams.get_mut(&id)?;
        let unsubscribe = stream.unsubscribe_frame();

        let (waiting, live): (Vec<_>, Vec<_>) = std::mem::take(&mut stream.subscribers)
            .into_iter()
            .partition(|sub| sub.ack.is_some());
        stream.subscribers = live;
        warn!(
            stream = %id,
            key = %stream.target.key,
            failed = waiting.len(),
            kept = stream.subscribers.len(),
            "subscribe ack timed out"
        );
        for sub in waiting {
            self.owners.remove(&sub.id);
            sub.fail(error.duplicate());
        }

        let retry = if stream.subscribers.is_empty() {
            self.take_stream(id);
            None
        } else {
            Some(stream.subscribe_frame())
        };
        Some(AckTimeout { unsubscribe, retry })
    }

    /// Routes one event. Returns how many streams took it, either delivered
    /// or parked awaiting an ack.
    pub fn route(
        &mut self,
        protocol: u32,
        message_type: u32,
        data: Option<&Map<String, Value>>,
        event: &Event,
        now: Instant,
    ) -> usize {
        let mut matched = 0;
        for stream in self.streams.values_mut() {
            if stream.target.protocol != protocol
                || stream.target.message_type != message_type
                || !stream.target.key.matches(data)
            {
                continue;
            }
            matched += 1;

            if stream.is_active() {
                stream.fan_out(event, &mut self.abandoned);
                continue;
            }
            let id = stream.id;
            if let SubState::Pending {
                early,
                first_buffered,
            } = &mut stream.state
            {
                if early.len() >= self.early_capacity {
                    warn!(
                        stream = %id,
                        capacity = self.early_capacity,
                        "early event buffer full, dropping event"
                    );
                    continue;
                }
                early.push_back(event.clone());
                first_buffered.get_or_insert(now);
            }
        }
        matched
    }

    /// Drops early-event buffers that have waited longer than `grace`.
    pub fn expire_buffers(&mut self, now: Instant, grace: Duration) {
        for stream in self.streams.values_mut() {
            let discarded = match &stream.state {
                SubState::Pending {
                    early,
                    first_buffered: Some(since),
                } if now.saturating_duration_since(*since) >= grace => early.len(),
                _ => continue,
            };
            warn!(
                stream = %stream.id,
                discarded,
                "no subscribe ack within grace window, discarding early events"
            );
            stream.state = SubState::pending();
        }
    }

    /// When the oldest early-event buffer runs out of grace.
    pub fn next_buffer_deadline(&self, grace: Duration) -> Option<Instant> {
        self.streams
            .values()
            .filter_map(|s| match s.state {
                SubState::Pending {
                    first_buffered: Some(since),
                    ..
                } => Some(since + grace),
                _ => None,
            })
            .min()
    }

    /// Detaches a subscriber. Later events for it are dropped. When it was
    /// the last one on its stream, the stream goes too and the returned
    /// value carries the unsubscribe frame.
    pub fn remove(&mut self, id: SubscriptionId) -> Option<Removed> {
        self.abandoned.retain(|a| *a != id);
        let stream_id = self.owners.remove(&id)?;
        let stream = self.streams.get_mut(&stream_id)?;
        let index = stream.subscribers.iter().position(|s| s.id == id)?;
        let sub = stream.subscribers.remove(index);
        let key = stream.target.key.clone();

        let unsubscribe = if stream.subscribers.is_empty() {
            let frame = stream.unsubscribe_frame();
            self.take_stream(stream_id);
            Some(frame)
        } else {
            None
        };
        Some(Removed {
            key,
            delivered: sub.delivered,
            unsubscribe,
        })
    }

    /// Subscribers whose receiver was dropped since the last call.
    pub fn take_abandoned(&mut self) -> Vec<SubscriptionId> {
        let mut abandoned = std::mem::take(&mut self.abandoned);
        abandoned.sort();
        abandoned.dedup();
        abandoned
    }

    /// Puts every stream back into the awaiting-ack state after the socket
    /// dropped. Nothing is failed.
    pub fn mark_all_pending(&mut self) {
        for stream in self.streams.values_mut() {
            stream.state = SubState::pending();
        }
    }

    /// One subscribe frame per stream, copied so replaying never iterates a
    /// live view.
    pub fn snapshot(&self) -> Vec<StreamFrame> {
        self.streams.values().map(Stream::subscribe_frame).collect()
    }

    /// Number of subscribers on acknowledged streams.
    pub fn active_count(&self) -> usize {
        self.streams
            .values()
            .filter(|s| s.is_active())
            .map(|s| s.subscribers.len())
            .sum()
    }

    /// Ends every subscription: ack waiters get `Closed`, event streams end.
    pub fn close_all(&mut self) {
        for (_, stream) in std::mem::take(&mut self.streams) {
            for mut sub in stream.subscribers {
                if let Some(ack) = sub.ack.take() {
                    let _ = ack.send(Err(ClientError::Closed));
                }
            }
        }
        self.by_identity.clear();
        self.owners.clear();
        self.abandoned.clear();
    }

    fn take_stream(&mut self, id: StreamId) -> Option<Stream> {
        let stream = self.streams.remove(&id)?;
        self.by_identity.remove(&stream.target.identity());
        for sub in &stream.subscribers {
            self.owners.remove(&sub.id);
        }
        Some(stream)
    }
}

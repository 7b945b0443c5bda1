//! The multiplexing core, free of I/O.
//!
//! [`Engine`] owns the sequence counters, both registries and the queue of
//! calls made while offline. The connection task feeds it inbound text,
//! commands, lifecycle transitions and the clock, then writes whatever
//! frames [`Engine::take_outgoing`] hands back. Keeping this synchronous
//! means every ordering rule can be tested without a socket or a runtime.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use skylink_protocol::{FrameKind, InboundFrame, OutboundFrame, Payload, decode_frame, encode_outbound};

use crate::calls::{CallKey, CallRegistry, Followup, PendingCall, Resolution, Waiter};
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::message::{Event, Reply, SubscriptionId};
use crate::sequence::SequenceAllocator;
use crate::subscriptions::{
    AckTimeout, ResourceKey, StreamFrame, StreamId, Subscriber, SubscriptionRegistry, Target,
};

/// Timing and sizing knobs the engine needs from [`ClientConfig`].
#[derive(Debug, Clone)]
pub(crate) struct EngineSettings {
    pub call_timeout: Option<Duration>,
    pub ack_timeout: Option<Duration>,
    pub grace: Duration,
    pub early_event_capacity: usize,
}

impl EngineSettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            call_timeout: config.call_timeout(),
            ack_timeout: config.ack_timeout(),
            grace: config.grace_window(),
            early_event_capacity: config.subscriptions.early_event_capacity,
        }
    }
}

/// A request/response call handed to the engine.
#[derive(Debug)]
pub(crate) struct CallRequest {
    pub protocol: u32,
    pub message_type: u32,
    pub payload: Payload,
    pub timeout: Option<Duration>,
    pub reply: oneshot::Sender<ClientResult<Reply>>,
}

/// A subscription handed to the engine.
#[derive(Debug)]
pub(crate) struct SubscribeRequest {
    pub id: SubscriptionId,
    pub protocol: u32,
    pub message_type: u32,
    pub unsubscribe_type: u32,
    pub payload: Payload,
    pub key: ResourceKey,
    pub events: mpsc::Sender<ClientResult<Event>>,
    pub ack: oneshot::Sender<ClientResult<()>>,
}

#[derive(Debug)]
struct QueuedCall {
    request: CallRequest,
    deadline: Option<Instant>,
}

/// Sequencing, correlation and routing state for one logical client.
#[derive(Debug)]
pub(crate) struct Engine {
    settings: EngineSettings,
    open: bool,
    sequences: SequenceAllocator,
    calls: CallRegistry,
    subscriptions: SubscriptionRegistry,
    outbox: VecDeque<QueuedCall>,
    outgoing: Vec<String>,
}

impl Engine {
    pub fn new(settings: EngineSettings) -> Self {
        let subscriptions = SubscriptionRegistry::new(settings.early_event_capacity);
        Self {
            settings,
            open: false,
            sequences: SequenceAllocator::new(),
            calls: CallRegistry::new(),
            subscriptions,
            outbox: VecDeque::new(),
            outgoing: Vec::new(),
        }
    }

    /// Frames ready to be written, in send order.
    pub fn take_outgoing(&mut self) -> Vec<String> {
        std::mem::take(&mut self.outgoing)
    }

    // -----------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------

    /// Sends a call now, or queues it until the connection opens. The
    /// timeout runs from submission either way.
    pub fn submit_call(&mut self, request: CallRequest, now: Instant) {
        if request.reply.is_closed() {
            debug!("caller gone before the call was sent, skipping");
            return;
        }
        let deadline = request.timeout.map(|t| now + t);
        if self.open {
            self.send_call(request, deadline, now);
        } else {
            debug!(
                protocol = request.protocol,
                message_type = request.message_type,
                queued = self.outbox.len() + 1,
                "not connected, queueing call"
            );
            self.outbox.push_back(QueuedCall { request, deadline });
        }
    }

    /// Registers a subscription and sends its subscribe frame when open.
    /// Offline, it waits for the next open like any other subscription.
    /// A subscription whose identity is already streamed shares that stream
    /// and sends nothing.
    pub fn submit_subscribe(&mut self, request: SubscribeRequest, now: Instant) {
        let SubscribeRequest {
            id,
            protocol,
            message_type,
            unsubscribe_type,
            payload,
            key,
            events,
            ack,
        } = request;
        let target = Target {
            protocol,
            message_type,
            unsubscribe_type,
            payload,
            key,
        };
        let opened = self
            .subscriptions
            .join(target, Subscriber::new(id, events, ack));
        if let Some(frame) = opened {
            if self.open {
                self.send_subscribe(frame, now);
            }
        }
        self.reap_abandoned(now);
    }

    /// Detaches a subscription. The server is told only when it was the
    /// last subscriber on its stream, and only if connected. Events already
    /// in flight for it are dropped on arrival.
    pub fn cancel(&mut self, id: SubscriptionId, now: Instant) {
        let Some(removed) = self.subscriptions.remove(id) else {
            debug!(subscription = %id, "cancel for unknown subscription");
            return;
        };
        info!(
            subscription = %id,
            key = %removed.key,
            delivered = removed.delivered,
            "subscription cancelled"
        );
        match removed.unsubscribe {
            Some(frame) if self.open => self.send_unsubscribe(frame, now),
            Some(_) => {}
            None => debug!(subscription = %id, "stream still has subscribers, keeping it"),
        }
    }

    // -----------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------

    /// Routes one inbound text frame.
    ///
    /// A frame whose `(protocol, sequence)` matches a pending call is that
    /// call's response. Otherwise a frame carrying `dt` is an event. Anything
    /// else is logged and dropped.
    pub fn handle_text(&mut self, text: &str, now: Instant) {
        let frame = match decode_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "discarding undecodable frame");
                return;
            }
        };
        if frame.is_malformed() {
            warn!(frame = %frame, "malformed frame body, delivering anyway");
        }

        let key = CallKey::new(frame.protocol, frame.sequence);
        if self.calls.is_pending(&key) {
            let outcome = response_outcome(frame);
            if let Resolution::Followup(followup) = self.calls.resolve(key, outcome) {
                self.apply_followup(followup, now);
            }
        } else if let Some(event) = Event::from_frame(&frame) {
            let routed = self.subscriptions.route(
                frame.protocol,
                frame.message_type,
                frame.data_object(),
                &event,
                now,
            );
            if routed == 0 {
                debug!(
                    protocol = frame.protocol,
                    message_type = frame.message_type,
                    dt = %event.dt,
                    "no subscription for event, discarding"
                );
            }
        } else {
            debug!(call = %key, kind = ?frame.kind(), "unmatched frame, discarding");
        }

        self.reap_abandoned(now);
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    /// The socket just opened. Order matters: fresh sequence space, stale
    /// calls failed, subscriptions replayed, then queued calls flushed.
    pub fn on_open(&mut self, now: Instant) {
        self.open = true;
        self.sequences.reset();
        for followup in self.calls.fail_all() {
            self.apply_followup(followup, now);
        }

        self.subscriptions.mark_all_pending();
        let replay = self.subscriptions.snapshot();
        if !replay.is_empty() {
            info!(count = replay.len(), "resubscribing");
        }
        for frame in replay {
            self.send_subscribe(frame, now);
        }

        let queued = std::mem::take(&mut self.outbox);
        if !queued.is_empty() {
            debug!(count = queued.len(), "flushing queued calls");
        }
        for QueuedCall { request, deadline } in queued {
            if request.reply.is_closed() {
                continue;
            }
            self.send_call(request, deadline, now);
        }
    }

    /// The socket dropped. Pending calls fail with `ConnectionLost`;
    /// subscriptions stay registered and wait for the next open.
    pub fn on_disconnect(&mut self, now: Instant) {
        info!(
            calls = self.calls.len(),
            subscriptions = self.subscriptions.active_count(),
            "connection lost, failing calls and keeping subscriptions"
        );
        self.open = false;
        self.outgoing.clear();
        for followup in self.calls.fail_all() {
            self.apply_followup(followup, now);
        }
        self.subscriptions.mark_all_pending();
    }

    /// Fails everything with `Closed` and ends every event stream.
    pub fn shutdown(&mut self) {
        debug!(
            calls = self.calls.len(),
            queued = self.outbox.len(),
            subscriptions = self.subscriptions.len(),
            "shutting down"
        );
        self.open = false;
        self.outgoing.clear();
        // Subscribe/unsubscribe followups are moot: the registry is closed next.
        let _ = self.calls.drain_with(|| ClientError::Closed);
        for queued in self.outbox.drain(..) {
            let _ = queued.request.reply.send(Err(ClientError::Closed));
        }
        self.subscriptions.close_all();
    }

    // -----------------------------------------------------------------
    // Time
    // -----------------------------------------------------------------

    /// Fires every deadline at or before `now`.
    pub fn expire(&mut self, now: Instant) {
        for followup in self.calls.expire(now) {
            self.apply_followup(followup, now);
        }

        let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.outbox)
            .into_iter()
            .partition(|q| q.deadline.is_some_and(|d| d <= now));
        self.outbox = kept.into();
        for queued in expired {
            warn!(
                protocol = queued.request.protocol,
                message_type = queued.request.message_type,
                "queued call timed out before the connection opened"
            );
            let _ = queued
                .request
                .reply
                .send(Err(ClientError::timeout("connection to send call")));
        }

        self.subscriptions.expire_buffers(now, self.settings.grace);
        self.reap_abandoned(now);
    }

    /// Earliest instant at which [`Engine::expire`] has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.calls.next_deadline(),
            self.outbox.iter().filter_map(|q| q.deadline).min(),
            self.subscriptions.next_buffer_deadline(self.settings.grace),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    fn send_call(&mut self, request: CallRequest, deadline: Option<Instant>, now: Instant) {
        let CallRequest {
            protocol,
            message_type,
            payload,
            reply,
            ..
        } = request;
        let sequence = self.sequences.next(protocol);
        let frame = OutboundFrame::new(protocol, message_type, sequence, payload);
        match encode_outbound(&frame) {
            Ok(text) => {
                debug!(call = %CallKey::new(protocol, sequence), message_type, "sending call");
                self.calls.register(
                    CallKey::new(protocol, sequence),
                    PendingCall {
                        message_type,
                        created_at: now,
                        deadline,
                        waiter: Waiter::Reply(reply),
                    },
                );
                self.outgoing.push(text);
            }
            Err(e) => {
                let _ = reply.send(Err(e.into()));
            }
        }
    }

    fn send_subscribe(&mut self, frame: StreamFrame, now: Instant) {
        let stream = frame.stream;
        let deadline = self.settings.ack_timeout.map(|t| now + t);
        if let Err(e) = self.send_stream_frame(frame, deadline, Waiter::Subscribe(stream), now) {
            self.subscriptions.acknowledge(stream, Err(e));
        }
    }

    fn send_unsubscribe(&mut self, frame: StreamFrame, now: Instant) {
        let stream = frame.stream;
        let deadline = self.settings.call_timeout.map(|t| now + t);
        if let Err(e) = self.send_stream_frame(frame, deadline, Waiter::Unsubscribe(stream), now) {
            warn!(stream = %stream, error = %e, "failed to encode unsubscribe");
        }
    }

    fn send_stream_frame(
        &mut self,
        frame: StreamFrame,
        deadline: Option<Instant>,
        waiter: Waiter,
        now: Instant,
    ) -> ClientResult<()> {
        let StreamFrame {
            stream,
            protocol,
            message_type,
            payload,
        } = frame;
        let sequence = self.sequences.next(protocol);
        let text = encode_outbound(&OutboundFrame::new(protocol, message_type, sequence, payload))?;
        let key = CallKey::new(protocol, sequence);
        debug!(%stream, call = %key, message_type, "sending stream request");
        self.calls.register(
            key,
            PendingCall {
                message_type,
                created_at: now,
                deadline,
                waiter,
            },
        );
        self.outgoing.push(text);
        Ok(())
    }

    fn apply_followup(&mut self, followup: Followup, now: Instant) {
        match followup {
            Followup::Subscribe { stream, outcome } => match outcome {
                Ok(_) => self.subscriptions.acknowledge(stream, Ok(())),
                // Still registered; the next open resubscribes it.
                Err(ClientError::ConnectionLost) => {
                    debug!(%stream, "subscribe interrupted by disconnect");
                }
                Err(e @ ClientError::Timeout { .. }) => self.subscribe_timed_out(stream, e, now),
                Err(e) => self.subscriptions.acknowledge(stream, Err(e)),
            },
            Followup::Unsubscribe { stream, outcome } => match outcome {
                Ok(_) => debug!(%stream, "unsubscribe acknowledged"),
                Err(e) => debug!(%stream, error = %e, "unsubscribe not acknowledged"),
            },
        }
        self.reap_abandoned(now);
    }

    /// The server may have set the stream up without acking it, so it is
    /// withdrawn. Subscribers that were live before keep waiting on a fresh
    /// subscribe.
    fn subscribe_timed_out(&mut self, stream: StreamId, error: ClientError, now: Instant) {
        let Some(AckTimeout { unsubscribe, retry }) =
            self.subscriptions.ack_timed_out(stream, error)
        else {
            return;
        };
        if !self.open {
            return;
        }
        self.send_unsubscribe(unsubscribe, now);
        if let Some(frame) = retry {
            info!(%stream, "resubscribing after ack timeout");
            self.send_subscribe(frame, now);
        }
    }

    fn reap_abandoned(&mut self, now: Instant) {
        for id in self.subscriptions.take_abandoned() {
            debug!(subscription = %id, "subscriber dropped its receiver");
            self.cancel(id, now);
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_calls(&self) -> usize {
        self.calls.len()
    }

    #[cfg(test)]
    pub(crate) fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    #[cfg(test)]
    pub(crate) fn stream_count(&self) -> usize {
        self.subscriptions.stream_count()
    }

    #[cfg(test)]
    pub(crate) fn active_subscriptions(&self) -> usize {
        self.subscriptions.active_count()
    }
}

fn response_outcome(frame: InboundFrame) -> ClientResult<Reply> {
    match frame.kind() {
        FrameKind::Error => {
            let error_type = frame.body.et.unwrap_or_default();
            let message = frame.body.msg.unwrap_or_default();
            Err(ClientError::server(error_type, message))
        }
        FrameKind::Data | FrameKind::Ack => Ok(Reply::from_frame(frame)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use skylink_protocol::decode_value;

    const PROTOCOL: u32 = 1;

    fn settings() -> EngineSettings {
        EngineSettings {
            call_timeout: Some(Duration::from_secs(5)),
            ack_timeout: Some(Duration::from_secs(2)),
            grace: Duration::from_millis(500),
            early_event_capacity: 8,
        }
    }

    fn open_engine(now: Instant) -> Engine {
        let mut engine = Engine::new(settings());
        engine.on_open(now);
        engine
    }

    fn call(
        engine: &mut Engine,
        message_type: u32,
        now: Instant,
    ) -> oneshot::Receiver<ClientResult<Reply>> {
        let (reply, rx) = oneshot::channel();
        engine.submit_call(
            CallRequest {
                protocol: PROTOCOL,
                message_type,
                payload: Payload::new().with("q", "x"),
                timeout: Some(Duration::from_secs(5)),
                reply,
            },
            now,
        );
        rx
    }

    struct Sub {
        events: mpsc::Receiver<ClientResult<Event>>,
        ack: oneshot::Receiver<ClientResult<()>>,
    }

    fn subscribe(engine: &mut Engine, id: u64, parameter: &str, now: Instant) -> Sub {
        let (events_tx, events) = mpsc::channel(16);
        let (ack_tx, ack) = oneshot::channel();
        let payload = Payload::new()
            .with("instance", "simulator")
            .with("parameter", parameter);
        engine.submit_subscribe(
            SubscribeRequest {
                id: SubscriptionId(id),
                protocol: PROTOCOL,
                message_type: 5,
                unsubscribe_type: 6,
                key: ResourceKey::from_payload(&payload, &[]),
                payload,
                events: events_tx,
                ack: ack_tx,
            },
            now,
        );
        Sub { events, ack }
    }

    /// Outgoing frames as `(protocol, message_type, sequence)`.
    fn sent(engine: &mut Engine) -> Vec<(u64, u64, u64)> {
        engine
            .take_outgoing()
            .iter()
            .map(|text| {
                let v: Value = serde_json::from_str(text).unwrap();
                (
                    v[0].as_u64().unwrap(),
                    v[1].as_u64().unwrap(),
                    v[2].as_u64().unwrap(),
                )
            })
            .collect()
    }

    fn event_text(sequence: u64, parameter: &str) -> String {
        json!([
            PROTOCOL,
            5,
            sequence,
            { "dt": "PARAMETER", "data": { "instance": "simulator", "parameter": parameter } }
        ])
        .to_string()
    }

    fn respond(engine: &mut Engine, sequence: u64, body: Value, now: Instant) {
        let frame = json!([PROTOCOL, 0, sequence, body]);
        assert!(decode_value(frame.clone()).is_ok());
        engine.handle_text(&frame.to_string(), now);
    }

    #[test]
    fn responses_correlate_regardless_of_order() {
        let now = Instant::now();
        let mut engine = open_engine(now);
        let mut a = call(&mut engine, 1, now);
        let mut b = call(&mut engine, 1, now);
        assert_eq!(sent(&mut engine), vec![(1, 1, 1), (1, 1, 2)]);

        respond(&mut engine, 2, json!({"dt": "R", "data": "b"}), now);
        respond(&mut engine, 1, json!({"dt": "R", "data": "a"}), now);

        assert_eq!(a.try_recv().unwrap().unwrap().data, Some(json!("a")));
        assert_eq!(b.try_recv().unwrap().unwrap().data, Some(json!("b")));
        assert_eq!(engine.pending_calls(), 0);
    }

    #[test]
    fn server_error_and_bare_ack() {
        let now = Instant::now();
        let mut engine = open_engine(now);
        let mut a = call(&mut engine, 1, now);
        let mut b = call(&mut engine, 1, now);

        respond(&mut engine, 1, json!({"et": "BadRequestException", "msg": "nope"}), now);
        respond(&mut engine, 2, json!({}), now);

        match a.try_recv().unwrap() {
            Err(ClientError::Server { error_type, message }) => {
                assert_eq!(error_type, "BadRequestException");
                assert_eq!(message, "nope");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(b.try_recv().unwrap().unwrap().is_ack());
    }

    #[test]
    fn error_wins_over_data_in_malformed_response() {
        let now = Instant::now();
        let mut engine = open_engine(now);
        let mut rx = call(&mut engine, 1, now);
        respond(&mut engine, 1, json!({"dt": "X", "data": 1, "et": "E", "msg": "m"}), now);
        assert!(matches!(rx.try_recv().unwrap(), Err(ClientError::Server { .. })));
    }

    #[test]
    fn mistyped_error_message_still_rejects_the_call() {
        let now = Instant::now();
        let mut engine = open_engine(now);
        let mut rx = call(&mut engine, 1, now);
        respond(&mut engine, 1, json!({"et": "E", "msg": 5}), now);
        match rx.try_recv().unwrap() {
            Err(ClientError::Server { error_type, message }) => {
                assert_eq!(error_type, "E");
                assert_eq!(message, "5");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(engine.pending_calls(), 0);
    }

    #[test]
    fn calls_made_offline_are_flushed_on_open() {
        let now = Instant::now();
        let mut engine = Engine::new(settings());
        let mut rx = call(&mut engine, 3, now);
        assert!(engine.take_outgoing().is_empty());

        engine.on_open(now);
        assert_eq!(sent(&mut engine), vec![(1, 3, 1)]);
        respond(&mut engine, 1, json!({"dt": "R", "data": 7}), now);
        assert_eq!(rx.try_recv().unwrap().unwrap().data, Some(json!(7)));
    }

    #[test]
    fn queued_call_times_out_while_offline() {
        let now = Instant::now();
        let mut engine = Engine::new(settings());
        let mut rx = call(&mut engine, 3, now);
        assert_eq!(engine.next_deadline(), Some(now + Duration::from_secs(5)));

        engine.expire(now + Duration::from_secs(5));
        assert!(matches!(rx.try_recv().unwrap(), Err(ClientError::Timeout { .. })));
        engine.on_open(now + Duration::from_secs(6));
        assert!(engine.take_outgoing().is_empty());
    }

    #[test]
    fn disconnect_fails_calls_and_reconnect_resets_sequences() {
        let now = Instant::now();
        let mut engine = open_engine(now);
        let mut a = call(&mut engine, 1, now);
        let _ = call(&mut engine, 1, now);
        engine.take_outgoing();

        engine.on_disconnect(now);
        assert!(matches!(a.try_recv().unwrap(), Err(ClientError::ConnectionLost)));
        assert_eq!(engine.pending_calls(), 0);

        engine.on_open(now);
        let _c = call(&mut engine, 1, now);
        assert_eq!(sent(&mut engine), vec![(1, 1, 1)]);
    }

    #[test]
    fn late_response_after_timeout_is_discarded() {
        let now = Instant::now();
        let mut engine = open_engine(now);
        let mut rx = call(&mut engine, 1, now);
        engine.expire(now + Duration::from_secs(5));
        assert!(matches!(rx.try_recv().unwrap(), Err(ClientError::Timeout { .. })));

        respond(&mut engine, 1, json!({"dt": "R", "data": 1}), now);
        assert_eq!(engine.pending_calls(), 0);
    }

    #[test]
    fn events_before_ack_are_delivered_after_it() {
        let now = Instant::now();
        let mut engine = open_engine(now);
        let mut sub = subscribe(&mut engine, 1, "X", now);
        assert_eq!(sent(&mut engine), vec![(1, 5, 1)]);

        engine.handle_text(&event_text(100, "X"), now);
        engine.handle_text(&event_text(101, "X"), now);
        assert!(sub.events.try_recv().is_err());

        respond(&mut engine, 1, json!({}), now);
        assert!(sub.ack.try_recv().unwrap().is_ok());
        assert_eq!(sub.events.try_recv().unwrap().unwrap().sequence, 100);
        assert_eq!(sub.events.try_recv().unwrap().unwrap().sequence, 101);

        engine.handle_text(&event_text(102, "X"), now);
        assert_eq!(sub.events.try_recv().unwrap().unwrap().sequence, 102);
    }

    #[test]
    fn events_route_by_resource_key() {
        let now = Instant::now();
        let mut engine = open_engine(now);
        let mut x = subscribe(&mut engine, 1, "X", now);
        let mut y = subscribe(&mut engine, 2, "Y", now);
        respond(&mut engine, 1, json!({}), now);
        respond(&mut engine, 2, json!({}), now);

        engine.handle_text(&event_text(10, "Y"), now);
        engine.handle_text(&event_text(11, "Z"), now);
        assert!(x.events.try_recv().is_err());
        assert_eq!(y.events.try_recv().unwrap().unwrap().sequence, 10);
        assert!(y.events.try_recv().is_err());
    }

    #[test]
    fn cancel_sends_unsubscribe_and_drops_later_events() {
        let now = Instant::now();
        let mut engine = open_engine(now);
        let mut sub = subscribe(&mut engine, 1, "X", now);
        respond(&mut engine, 1, json!({}), now);
        engine.take_outgoing();

        engine.cancel(SubscriptionId(1), now);
        assert_eq!(sent(&mut engine), vec![(1, 6, 2)]);
        engine.handle_text(&event_text(50, "X"), now);
        assert!(sub.events.try_recv().is_err());

        respond(&mut engine, 2, json!({}), now);
        assert_eq!(engine.pending_calls(), 0);
        assert_eq!(engine.subscription_count(), 0);
    }

    #[test]
    fn reconnect_resubscribes_before_flushing_queued_calls() {
        let now = Instant::now();
        let mut engine = open_engine(now);
        let mut sub = subscribe(&mut engine, 1, "X", now);
        respond(&mut engine, 1, json!({}), now);
        assert!(sub.ack.try_recv().unwrap().is_ok());
        engine.take_outgoing();

        engine.on_disconnect(now);
        assert_eq!(engine.active_subscriptions(), 0);
        let _queued = call(&mut engine, 9, now);

        engine.on_open(now);
        assert_eq!(sent(&mut engine), vec![(1, 5, 1), (1, 9, 2)]);
        assert_eq!(engine.subscription_count(), 1);

        respond(&mut engine, 1, json!({}), now);
        assert_eq!(engine.active_subscriptions(), 1);
        engine.handle_text(&event_text(7, "X"), now);
        assert_eq!(sub.events.try_recv().unwrap().unwrap().sequence, 7);
    }

    #[test]
    fn offline_subscribe_is_sent_on_open() {
        let now = Instant::now();
        let mut engine = Engine::new(settings());
        let mut sub = subscribe(&mut engine, 1, "X", now);
        assert!(engine.take_outgoing().is_empty());

        engine.on_open(now);
        assert_eq!(sent(&mut engine), vec![(1, 5, 1)]);
        respond(&mut engine, 1, json!({}), now);
        assert!(sub.ack.try_recv().unwrap().is_ok());
    }

    #[test]
    fn failed_resubscribe_is_surfaced_on_the_stream() {
        let now = Instant::now();
        let mut engine = open_engine(now);
        let mut sub = subscribe(&mut engine, 1, "X", now);
        respond(&mut engine, 1, json!({}), now);
        engine.on_disconnect(now);
        engine.on_open(now);

        respond(&mut engine, 1, json!({"et": "NotFound", "msg": "gone"}), now);
        assert!(matches!(
            sub.events.try_recv().unwrap(),
            Err(ClientError::Server { .. })
        ));
        assert_eq!(engine.subscription_count(), 0);
    }

    #[test]
    fn subscribe_ack_timeout_fails_the_subscriber_and_unsubscribes() {
        let now = Instant::now();
        let mut engine = open_engine(now);
        let mut sub = subscribe(&mut engine, 1, "X", now);
        assert_eq!(sent(&mut engine), vec![(1, 5, 1)]);

        engine.expire(now + Duration::from_secs(2));
        assert!(matches!(sub.ack.try_recv().unwrap(), Err(ClientError::Timeout { .. })));
        assert_eq!(sent(&mut engine), vec![(1, 6, 2)]);
        assert_eq!(engine.subscription_count(), 0);
    }

    #[test]
    fn replayed_subscription_survives_its_ack_timeout() {
        let now = Instant::now();
        let mut engine = open_engine(now);
        let mut sub = subscribe(&mut engine, 1, "X", now);
        respond(&mut engine, 1, json!({}), now);
        assert!(sub.ack.try_recv().unwrap().is_ok());
        engine.on_disconnect(now);
        engine.on_open(now);
        assert_eq!(sent(&mut engine), vec![(1, 5, 1)]);

        let later = now + Duration::from_secs(2);
        engine.expire(later);
        assert_eq!(sent(&mut engine), vec![(1, 6, 2), (1, 5, 3)]);
        assert_eq!(engine.subscription_count(), 1);
        assert!(sub.events.try_recv().is_err());

        respond(&mut engine, 3, json!({}), later);
        assert_eq!(engine.active_subscriptions(), 1);
        engine.handle_text(&event_text(40, "X"), later);
        assert_eq!(sub.events.try_recv().unwrap().unwrap().sequence, 40);
    }

    #[test]
    fn same_key_subscriptions_share_one_server_stream() {
        let now = Instant::now();
        let mut engine = open_engine(now);
        let mut first = subscribe(&mut engine, 1, "X", now);
        respond(&mut engine, 1, json!({}), now);
        let mut second = subscribe(&mut engine, 2, "X", now);
        assert_eq!(sent(&mut engine), vec![(1, 5, 1)]);
        assert!(first.ack.try_recv().unwrap().is_ok());
        assert!(second.ack.try_recv().unwrap().is_ok());
        assert_eq!(engine.stream_count(), 1);

        engine.cancel(SubscriptionId(1), now);
        assert!(engine.take_outgoing().is_empty());
        engine.handle_text(&event_text(20, "X"), now);
        assert!(first.events.try_recv().is_err());
        assert_eq!(second.events.try_recv().unwrap().unwrap().sequence, 20);

        engine.cancel(SubscriptionId(2), now);
        assert_eq!(sent(&mut engine), vec![(1, 6, 2)]);
        assert_eq!(engine.stream_count(), 0);
    }

    #[test]
    fn shared_stream_is_resubscribed_once() {
        let now = Instant::now();
        let mut engine = open_engine(now);
        let mut a = subscribe(&mut engine, 1, "X", now);
        let mut b = subscribe(&mut engine, 2, "X", now);
        respond(&mut engine, 1, json!({}), now);
        assert!(a.ack.try_recv().unwrap().is_ok());
        assert!(b.ack.try_recv().unwrap().is_ok());
        engine.take_outgoing();

        engine.on_disconnect(now);
        engine.on_open(now);
        assert_eq!(sent(&mut engine), vec![(1, 5, 1)]);
        respond(&mut engine, 1, json!({}), now);

        engine.handle_text(&event_text(30, "X"), now);
        assert_eq!(a.events.try_recv().unwrap().unwrap().sequence, 30);
        assert_eq!(b.events.try_recv().unwrap().unwrap().sequence, 30);
    }

    #[test]
    fn dropped_receiver_unsubscribes() {
        let now = Instant::now();
        let mut engine = open_engine(now);
        let sub = subscribe(&mut engine, 1, "X", now);
        respond(&mut engine, 1, json!({}), now);
        engine.take_outgoing();
        drop(sub);

        engine.handle_text(&event_text(1, "X"), now);
        assert_eq!(sent(&mut engine), vec![(1, 6, 2)]);
        assert_eq!(engine.subscription_count(), 0);
    }

    #[test]
    fn malformed_and_unmatched_frames_do_not_disturb_state() {
        let now = Instant::now();
        let mut engine = open_engine(now);
        let mut rx = call(&mut engine, 1, now);

        engine.handle_text("not json", now);
        engine.handle_text("[1, 2]", now);
        respond(&mut engine, 99, json!({}), now);
        assert_eq!(engine.pending_calls(), 1);

        respond(&mut engine, 1, json!({"dt": "R", "data": null}), now);
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn shutdown_fails_everything_with_closed() {
        let now = Instant::now();
        let mut engine = Engine::new(settings());
        let mut queued = call(&mut engine, 1, now);
        engine.on_open(now);
        let mut pending = call(&mut engine, 1, now);
        let mut sub = subscribe(&mut engine, 1, "X", now);

        engine.shutdown();
        assert!(matches!(queued.try_recv().unwrap(), Err(ClientError::Closed)));
        assert!(matches!(pending.try_recv().unwrap(), Err(ClientError::Closed)));
        assert!(matches!(sub.ack.try_recv().unwrap(), Err(ClientError::Closed)));
        assert!(matches!(
            sub.events.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}

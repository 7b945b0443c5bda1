//! Public handle to a multiplexed connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, Span, debug, info_span};

use skylink_protocol::Payload;

use crate::config::ClientConfig;
use crate::connection::{Command, ConnectionState, ConnectionTask};
use crate::engine::{CallRequest, Engine, EngineSettings, SubscribeRequest};
use crate::error::{ClientError, ClientResult};
use crate::message::{Event, Reply, SubscriptionId};
use crate::subscriptions::ResourceKey;
use crate::transport::{Connector, WebSocketConnector};

/// Per-call overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOptions {
    timeout: Option<Option<Duration>>,
}

impl CallOptions {
    /// Fail with `Timeout` if no response arrives within `timeout`.
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(Some(timeout)),
        }
    }

    /// Wait for the response indefinitely.
    pub fn no_timeout() -> Self {
        Self {
            timeout: Some(None),
        }
    }

    fn resolve(self, default: Option<Duration>) -> Option<Duration> {
        self.timeout.unwrap_or(default)
    }
}

/// Per-subscription overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    unsubscribe_type: Option<u32>,
    key_fields: Option<Vec<String>>,
    capacity: Option<usize>,
}

impl SubscribeOptions {
    /// Message type used to cancel, instead of the configured offset.
    pub fn unsubscribe_type(mut self, message_type: u32) -> Self {
        self.unsubscribe_type = Some(message_type);
        self
    }

    /// Payload fields that identify the resource. Empty means all of them.
    pub fn key_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Event channel size for this subscription.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }
}

/// Client for one multiplexed socket.
///
/// Cheap to clone; every clone drives the same connection. The connection
/// task runs until [`Client::close`] is called or every handle, including
/// live [`Subscription`]s, is dropped.
#[derive(Debug, Clone)]
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    config: Arc<ClientConfig>,
    next_id: Arc<AtomicU64>,
}

impl Client {
    /// Connects over WebSocket to the configured endpoint.
    ///
    /// Returns as soon as the connection task is started; calls made before
    /// the socket opens are queued. Must be called within a tokio runtime.
    pub fn connect(config: ClientConfig) -> ClientResult<Self> {
        config.validate()?;
        let connector = WebSocketConnector::new(config.endpoint()?, config.connection.headers.clone());
        Ok(Self::with_connector(config, connector))
    }

    /// Starts a client over any transport.
    pub fn with_connector<C: Connector>(config: ClientConfig, connector: C) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Connecting);

        let span = info_span!("connection", endpoint = %connector.describe());
        let task = ConnectionTask::new(
            connector,
            Engine::new(EngineSettings::from_config(&config)),
            command_rx,
            state_tx,
            config.reconnect.clone(),
            config.connect_timeout(),
        );
        tokio::spawn(task.run().instrument(span));

        Self {
            commands,
            state,
            config: Arc::new(config),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Sends a request and waits for its response, using the configured
    /// default timeout.
    pub async fn call(&self, protocol: u32, message_type: u32, payload: Payload) -> ClientResult<Reply> {
        self.call_with(protocol, message_type, payload, CallOptions::default())
            .await
    }

    /// Like [`Client::call`] with per-call options.
    pub async fn call_with(
        &self,
        protocol: u32,
        message_type: u32,
        payload: Payload,
        options: CallOptions,
    ) -> ClientResult<Reply> {
        let (reply, rx) = oneshot::channel();
        let request = CallRequest {
            protocol,
            message_type,
            payload,
            timeout: options.resolve(self.config.call_timeout()),
            reply,
        };
        self.send(Command::Call(request))?;
        rx.await.map_err(|_| ClientError::Closed)?
    }

    /// Opens a subscription and waits for the server's acknowledgement.
    ///
    /// Events that arrive before the ack are held and delivered right after
    /// it. While offline, the subscribe goes out when the socket opens.
    pub async fn subscribe(
        &self,
        protocol: u32,
        message_type: u32,
        payload: Payload,
    ) -> ClientResult<Subscription> {
        self.subscribe_with(protocol, message_type, payload, SubscribeOptions::default())
            .await
    }

    /// Like [`Client::subscribe`] with per-subscription options.
    pub async fn subscribe_with(
        &self,
        protocol: u32,
        message_type: u32,
        payload: Payload,
        options: SubscribeOptions,
    ) -> ClientResult<Subscription> {
        let settings = &self.config.subscriptions;
        let unsubscribe_type = match options.unsubscribe_type {
            Some(t) => t,
            None => message_type
                .checked_add(settings.unsubscribe_offset)
                .ok_or_else(|| {
                    ClientError::Encoding(format!(
                        "message type {message_type} has no unsubscribe counterpart"
                    ))
                })?,
        };
        let key_fields = options.key_fields.as_deref().unwrap_or(&settings.key_fields);
        let key = ResourceKey::from_payload(&payload, key_fields);
        let capacity = options.capacity.unwrap_or(settings.event_capacity).max(1);

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (events_tx, events) = mpsc::channel(capacity);
        let (ack, ack_rx) = oneshot::channel();

        // Built before awaiting so that abandoning this future cancels.
        let mut subscription = Subscription {
            id,
            key: key.clone(),
            events,
            commands: self.commands.clone(),
            cancelled: false,
        };

        self.send(Command::Subscribe(SubscribeRequest {
            id,
            protocol,
            message_type,
            unsubscribe_type,
            payload,
            key,
            events: events_tx,
            ack,
        }))?;

        match ack_rx.await {
            Ok(Ok(())) => Ok(subscription),
            Ok(Err(e)) => {
                subscription.cancelled = true;
                Err(e)
            }
            Err(_) => {
                subscription.cancelled = true;
                Err(ClientError::Closed)
            }
        }
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Waits until the socket is open. Fails with `Closed` if the client
    /// shuts down first.
    pub async fn wait_for_open(&self) -> ClientResult<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|s| *s == ConnectionState::Open)
            .await
            .map(|_| ())
            .map_err(|_| ClientError::Closed)
    }

    /// Closes the connection for every clone of this client. Pending calls
    /// fail with `Closed`, subscriptions end, and nothing reconnects.
    pub async fn close(&self) -> ClientResult<()> {
        let (done, rx) = oneshot::channel();
        if self.commands.send(Command::Close(done)).is_err() {
            debug!("close on an already closed client");
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    /// The configuration this client was started with.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn send(&self, command: Command) -> ClientResult<()> {
        self.commands.send(command).map_err(|_| ClientError::Closed)
    }
}

/// A live subscription.
///
/// Events arrive in order through [`Subscription::recv`]. The stream ends
/// when the subscription is cancelled, the client closes, or a resubscribe
/// after a reconnect is rejected (the rejection is the last item). Dropping
/// the handle cancels the subscription.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    key: ResourceKey,
    events: mpsc::Receiver<ClientResult<Event>>,
    commands: mpsc::UnboundedSender<Command>,
    cancelled: bool,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// The resource this subscription follows.
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Span carrying this subscription's id and key, for consumers that
    /// want their own logs tagged with it.
    pub fn span(&self) -> Span {
        info_span!("subscription", id = %self.id, key = %self.key)
    }

    /// Next event, or `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<ClientResult<Event>> {
        self.events.recv().await
    }

    /// Next event if one is ready.
    pub fn try_recv(&mut self) -> Option<ClientResult<Event>> {
        self.events.try_recv().ok()
    }

    /// Stops the subscription. Events already in flight are dropped.
    pub fn cancel(mut self) {
        self.send_cancel();
    }

    /// Runs `callback` for every event on a spawned task. The subscription
    /// is cancelled when the task is aborted or the stream ends.
    pub fn for_each<F>(mut self, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(ClientResult<Event>) + Send + 'static,
    {
        let span = self.span();
        tokio::spawn(
            async move {
                while let Some(item) = self.recv().await {
                    callback(item);
                }
            }
            .instrument(span),
        )
    }

    fn send_cancel(&mut self) {
        if !self.cancelled {
            self.cancelled = true;
            let _ = self.commands.send(Command::Cancel(self.id));
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.send_cancel();
    }
}

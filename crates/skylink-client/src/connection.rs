//! The connection task.
//!
//! One background task owns the socket and the [`Engine`]. Public handles
//! talk to it over a command channel, so no state is shared and no locks are
//! taken. The task loops through three phases until closed:
//!
//! 1. connecting: one attempt, bounded by the connect timeout
//! 2. open: multiplex socket reads, commands and engine deadlines
//! 3. backoff: wait out the reconnect delay
//!
//! Commands are served in every phase. Calls made while offline queue in the
//! engine; a close request ends the task from wherever it is.

use std::fmt;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use skylink_core::BackoffConfig;

use crate::engine::{CallRequest, Engine, SubscribeRequest};
use crate::message::SubscriptionId;
use crate::transport::{Connector, FrameSink, Transport, TransportError};

/// Lifecycle of the shared socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// A connect attempt is in progress.
    Connecting,
    /// The socket is up; calls go straight out.
    Open,
    /// The owner asked to close; nothing will reconnect.
    Closing,
    /// No socket. Terminal after a close, otherwise a reconnect is scheduled.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Requests from client handles to the connection task.
#[derive(Debug)]
pub(crate) enum Command {
    Call(CallRequest),
    Subscribe(SubscribeRequest),
    Cancel(SubscriptionId),
    Close(oneshot::Sender<()>),
}

/// How a phase ended.
enum Exit {
    /// Keep going with the next phase.
    Continue,
    /// Close was requested (or every handle is gone).
    Stop(Option<oneshot::Sender<()>>),
}

pub(crate) struct ConnectionTask<C> {
    connector: C,
    engine: Engine,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    backoff: BackoffConfig,
    connect_timeout: Duration,
}

impl<C: Connector> ConnectionTask<C> {
    pub fn new(
        connector: C,
        engine: Engine,
        commands: mpsc::UnboundedReceiver<Command>,
        state: watch::Sender<ConnectionState>,
        backoff: BackoffConfig,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            engine,
            commands,
            state,
            backoff,
            connect_timeout,
        }
    }

    /// Runs until closed.
    pub async fn run(mut self) {
        let target = self.connector.describe();
        let mut failures: u32 = 0;

        let done = loop {
            self.publish(ConnectionState::Connecting);
            let transport = match self.connect_phase(&target).await {
                Ok(Some(transport)) => transport,
                Ok(None) => {
                    failures = failures.saturating_add(1);
                    self.publish(ConnectionState::Closed);
                    match self.backoff_phase(failures).await {
                        Exit::Continue => continue,
                        Exit::Stop(done) => break done,
                    }
                }
                Err(done) => break done,
            };

            info!(endpoint = %target, "connected");
            match self.open_phase(transport).await {
                Exit::Continue => {
                    // A dropped connection counts as the first failure.
                    failures = 1;
                    self.publish(ConnectionState::Closed);
                    match self.backoff_phase(failures).await {
                        Exit::Continue => {}
                        Exit::Stop(done) => break done,
                    }
                }
                Exit::Stop(done) => break done,
            }
        };

        self.publish(ConnectionState::Closing);
        self.engine.shutdown();
        self.publish(ConnectionState::Closed);
        info!(endpoint = %target, "connection closed");
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    fn publish(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "connection state");
        }
    }

    /// One connect attempt. `Ok(None)` means it failed and should be retried.
    async fn connect_phase(
        &mut self,
        target: &str,
    ) -> Result<Option<Transport>, Option<oneshot::Sender<()>>> {
        let attempt = tokio::time::timeout(self.connect_timeout, self.connector.connect());
        tokio::pin!(attempt);

        loop {
            let deadline = self.engine.next_deadline();
            tokio::select! {
                result = &mut attempt => {
                    return Ok(match result {
                        Ok(Ok(transport)) => Some(transport),
                        Ok(Err(e)) => {
                            warn!(endpoint = %target, error = %e, "connect failed");
                            None
                        }
                        Err(_) => {
                            warn!(
                                endpoint = %target,
                                timeout_ms = self.connect_timeout.as_millis() as u64,
                                "connect timed out"
                            );
                            None
                        }
                    });
                }
                cmd = self.commands.recv() => {
                    if let Exit::Stop(done) = Self::handle_command(&mut self.engine, cmd) {
                        return Err(done);
                    }
                }
                _ = sleep_until(deadline), if deadline.is_some() => {
                    self.engine.expire(Instant::now());
                }
            }
        }
    }

    /// Serves an open socket until it drops or a close is requested.
    async fn open_phase(&mut self, transport: Transport) -> Exit {
        let Transport {
            mut sink,
            mut stream,
        } = transport;

        self.engine.on_open(Instant::now());
        self.publish(ConnectionState::Open);

        let exit = loop {
            if let Err(e) = flush(&mut sink, self.engine.take_outgoing()).await {
                warn!(error = %e, "send failed, dropping connection");
                break Exit::Continue;
            }

            let deadline = self.engine.next_deadline();
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(text)) => self.engine.handle_text(&text, Instant::now()),
                    Some(Err(TransportError::Closed { code, reason })) => {
                        info!(code, reason = %reason, "server closed the connection");
                        break Exit::Continue;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "socket error");
                        break Exit::Continue;
                    }
                    None => {
                        info!("connection lost");
                        break Exit::Continue;
                    }
                },
                cmd = self.commands.recv() => {
                    if let Exit::Stop(done) = Self::handle_command(&mut self.engine, cmd) {
                        break Exit::Stop(done);
                    }
                }
                _ = sleep_until(deadline), if deadline.is_some() => {
                    self.engine.expire(Instant::now());
                }
            }
        };

        match exit {
            Exit::Continue => self.engine.on_disconnect(Instant::now()),
            Exit::Stop(_) => {
                self.publish(ConnectionState::Closing);
                // Unsubscribes issued just before the close still go out.
                if let Err(e) = flush(&mut sink, self.engine.take_outgoing()).await {
                    debug!(error = %e, "could not flush before closing");
                }
                if let Err(e) = sink.close().await {
                    debug!(error = %e, "error closing socket");
                }
            }
        }
        exit
    }

    /// Waits out the reconnect delay while still serving commands.
    async fn backoff_phase(&mut self, failures: u32) -> Exit {
        let delay = self.backoff.delay(failures);
        info!(
            delay_ms = delay.as_millis() as u64,
            failures,
            "reconnecting after delay"
        );
        let wake = Instant::now() + delay;

        loop {
            let deadline = self.engine.next_deadline();
            tokio::select! {
                _ = tokio::time::sleep_until(wake) => return Exit::Continue,
                cmd = self.commands.recv() => {
                    if let Exit::Stop(done) = Self::handle_command(&mut self.engine, cmd) {
                        return Exit::Stop(done);
                    }
                }
                _ = sleep_until(deadline), if deadline.is_some() => {
                    self.engine.expire(Instant::now());
                }
            }
        }
    }

    fn handle_command(engine: &mut Engine, cmd: Option<Command>) -> Exit {
        let now = Instant::now();
        match cmd {
            Some(Command::Call(request)) => engine.submit_call(request, now),
            Some(Command::Subscribe(request)) => engine.submit_subscribe(request, now),
            Some(Command::Cancel(id)) => engine.cancel(id, now),
            Some(Command::Close(done)) => {
                info!("close requested");
                return Exit::Stop(Some(done));
            }
            None => {
                debug!("all client handles dropped");
                return Exit::Stop(None);
            }
        }
        Exit::Continue
    }
}

async fn flush(
    sink: &mut FrameSink,
    frames: Vec<String>,
) -> Result<(), TransportError> {
    if frames.is_empty() {
        return Ok(());
    }
    for frame in frames {
        sink.feed(frame).await?;
    }
    sink.flush().await
}

/// Sleeps until `deadline`, or forever when there is none.
async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

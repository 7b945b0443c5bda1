//! In-flight request/response correlation.
//!
//! Calls are keyed by `(protocol, sequence)` and nothing else; the order in
//! which responses arrive never matters.

use std::collections::HashMap;
use std::fmt;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{ClientError, ClientResult};
use crate::message::Reply;
use crate::subscriptions::StreamId;

/// Correlation key of a pending call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallKey {
    /// Logical channel.
    pub protocol: u32,
    /// Request sequence within that channel.
    pub sequence: u64,
}

impl CallKey {
    /// Creates a key.
    pub fn new(protocol: u32, sequence: u64) -> Self {
        Self { protocol, sequence }
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.protocol, self.sequence)
    }
}

/// Who is waiting on a call.
#[derive(Debug)]
pub(crate) enum Waiter {
    /// A caller awaiting the reply.
    Reply(oneshot::Sender<ClientResult<Reply>>),
    /// The subscription registry, awaiting a subscribe ack.
    Subscribe(StreamId),
    /// Nobody in particular: the outcome of an unsubscribe is only logged.
    Unsubscribe(StreamId),
}

/// A registered call awaiting its response.
#[derive(Debug)]
pub(crate) struct PendingCall {
    pub message_type: u32,
    pub created_at: Instant,
    pub deadline: Option<Instant>,
    pub waiter: Waiter,
}

/// Outcome for the subscription side, handed back to the caller of the
/// registry because the registry does not own subscriptions.
#[derive(Debug)]
pub(crate) enum Followup {
    Subscribe {
        stream: StreamId,
        outcome: ClientResult<Reply>,
    },
    Unsubscribe {
        stream: StreamId,
        outcome: ClientResult<Reply>,
    },
}

/// Result of [`CallRegistry::resolve`].
#[derive(Debug)]
pub(crate) enum Resolution {
    /// A caller's reply slot was filled.
    Completed,
    /// The call belonged to a subscription operation.
    Followup(Followup),
    /// Nothing was pending under that key (late or duplicate response).
    Unmatched,
}

/// Registry of pending calls.
#[derive(Debug, Default)]
pub(crate) struct CallRegistry {
    pending: HashMap<CallKey, PendingCall>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a call under `key`.
    pub fn register(&mut self, key: CallKey, call: PendingCall) {
        if let Some(previous) = self.pending.insert(key, call) {
            // Sequences are never reused while pending; this would be a bug.
            warn!(call = %key, "replacing a pending call with the same key");
            complete(key, previous, Err(ClientError::ConnectionLost));
        }
    }

    /// Whether a call is pending under `key`.
    pub fn is_pending(&self, key: &CallKey) -> bool {
        self.pending.contains_key(key)
    }

    /// Fills the slot of the call under `key`, exactly once.
    pub fn resolve(&mut self, key: CallKey, outcome: ClientResult<Reply>) -> Resolution {
        match self.pending.remove(&key) {
            Some(call) => {
                debug!(
                    call = %key,
                    elapsed_ms = call.created_at.elapsed().as_millis() as u64,
                    ok = outcome.is_ok(),
                    "call resolved"
                );
                complete(key, call, outcome)
            }
            None => {
                debug!(call = %key, "no pending call for response, discarding");
                Resolution::Unmatched
            }
        }
    }

    /// Times out every call whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<Followup> {
        let expired: Vec<CallKey> = self
            .pending
            .iter()
            .filter(|(_, call)| call.deadline.is_some_and(|d| d <= now))
            .map(|(key, _)| *key)
            .collect();

        let mut followups = Vec::new();
        for key in expired {
            if let Some(call) = self.pending.remove(&key) {
                warn!(call = %key, message_type = call.message_type, "call timed out");
                let operation = format!("response to call {key}");
                if let Resolution::Followup(f) =
                    complete(key, call, Err(ClientError::timeout(operation)))
                {
                    followups.push(f);
                }
            }
        }
        followups
    }

    /// Fails every pending call with `ConnectionLost` and empties the
    /// registry. Calling it on an empty registry does nothing.
    pub fn fail_all(&mut self) -> Vec<Followup> {
        self.drain_with(|| ClientError::ConnectionLost)
    }

    /// Like [`CallRegistry::fail_all`] with a caller-chosen error.
    pub fn drain_with(&mut self, error: impl Fn() -> ClientError) -> Vec<Followup> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        debug!(count = self.pending.len(), "failing all pending calls");

        let mut followups = Vec::new();
        for (key, call) in self.pending.drain() {
            if let Resolution::Followup(f) = complete(key, call, Err(error())) {
                followups.push(f);
            }
        }
        followups
    }

    /// Earliest deadline among pending calls.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().filter_map(|c| c.deadline).min()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

fn complete(key: CallKey, call: PendingCall, outcome: ClientResult<Reply>) -> Resolution {
    match call.waiter {
        Waiter::Reply(tx) => {
            if tx.send(outcome).is_err() {
                debug!(call = %key, "caller stopped waiting before the response");
            }
            Resolution::Completed
        }
        Waiter::Subscribe(stream) => Resolution::Followup(Followup::Subscribe { stream, outcome }),
        Waiter::Unsubscribe(stream) => {
            Resolution::Followup(Followup::Unsubscribe { stream, outcome })
        }
    }
}

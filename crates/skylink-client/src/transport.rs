//! Socket transports.
//!
//! The connection task only needs a text sink and a text stream. A
//! [`Connector`] produces one such pair per connect attempt. Two
//! implementations ship here: [`WebSocketConnector`] over
//! `tokio-tungstenite`, and [`MemoryConnector`], an in-process pair used by
//! tests and by embedders that want to drive the client by hand.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::stream::BoxStream;
use futures_util::{Sink, SinkExt, StreamExt, future};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tracing::{debug, warn};
use url::Url;

/// Errors raised by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The connect attempt or handshake failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Reading or writing the socket failed.
    #[error("socket error: {0}")]
    Io(String),

    /// The peer closed the socket.
    #[error("closed by peer ({code}): {reason}")]
    Closed { code: u16, reason: String },
}

/// Outbound half: one text frame per item.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

/// Inbound half: one text frame per item. Ends when the socket closes.
pub type FrameStream = BoxStream<'static, Result<String, TransportError>>;

/// An open socket, split for use in a `select!` loop.
pub struct Transport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// Opens sockets on demand. Called once per connect attempt.
pub trait Connector: Send + Sync + 'static {
    /// Establishes a new socket.
    fn connect(&self) -> impl Future<Output = Result<Transport, TransportError>> + Send;

    /// Where this connector points, for logs.
    fn describe(&self) -> String;
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

/// Connects over WebSocket with optional handshake headers.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: Url,
    headers: BTreeMap<String, String>,
}

impl WebSocketConnector {
    pub fn new(url: Url, headers: BTreeMap<String, String>) -> Self {
        Self { url, headers }
    }
}

impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Transport, TransportError> {
        use tungstenite::client::IntoClientRequest;

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(format!("invalid url {}: {e}", self.url)))?;

        for (name, value) in &self.headers {
            let header_name = tungstenite::http::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Connect(format!("invalid header name {name}: {e}")))?;
            let header_value = tungstenite::http::HeaderValue::from_str(value)
                .map_err(|e| TransportError::Connect(format!("invalid header value for {name}: {e}")))?;
            request.headers_mut().insert(header_name, header_value);
        }

        let (ws_stream, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!(url = %self.url, status = %response.status(), "websocket handshake complete");

        let (sink, stream) = ws_stream.split();

        let sink = sink
            .sink_map_err(|e| TransportError::Io(e.to_string()))
            .with(|text: String| future::ready(Ok::<_, TransportError>(tungstenite::Message::Text(text))));

        let stream = stream.filter_map(|message| future::ready(inbound_text(message)));

        Ok(Transport {
            sink: Box::pin(sink),
            stream: stream.boxed(),
        })
    }

    fn describe(&self) -> String {
        self.url.to_string()
    }
}

/// Maps one WebSocket message to a text frame, skipping control frames.
/// Binary frames count as text when they hold UTF-8 and are dropped otherwise.
fn inbound_text(
    message: Result<tungstenite::Message, tungstenite::Error>,
) -> Option<Result<String, TransportError>> {
    match message {
        Ok(tungstenite::Message::Text(text)) => Some(Ok(text.to_string())),
        Ok(tungstenite::Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
            Ok(text) => Some(Ok(text)),
            Err(_) => {
                warn!(len = data.len(), "ignoring non-UTF-8 binary frame");
                None
            }
        },
        Ok(tungstenite::Message::Close(frame)) => {
            let (code, reason) = frame
                .map(|cf| (cf.code.into(), cf.reason.to_string()))
                .unwrap_or((1005, String::new()));
            Some(Err(TransportError::Closed { code, reason }))
        }
        Ok(tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_)) => None,
        Ok(tungstenite::Message::Frame(_)) => None,
        Err(e) => Some(Err(TransportError::Io(e.to_string()))),
    }
}

/// Convert an HTTP(S) URL to WS(S) scheme.
///
/// Passes `ws://` and `wss://` through unchanged.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Server side of one in-memory connection.
#[derive(Debug)]
pub struct MemoryPeer {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<Result<String, TransportError>>,
}

impl MemoryPeer {
    /// Next frame the client wrote, or `None` once the client hung up.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Sends a text frame to the client. Returns false if the client is gone.
    pub fn send(&self, text: impl Into<String>) -> bool {
        self.to_client.send(Ok(text.into())).is_ok()
    }

    /// Ends the connection from the server side, as a dropped socket would.
    pub fn disconnect(self) {}
}

/// Server side of a [`MemoryConnector`]: accepts the client's connections.
#[derive(Debug)]
pub struct MemoryServer {
    accepted: mpsc::UnboundedReceiver<MemoryPeer>,
    refusals: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
}

impl MemoryServer {
    /// Waits for the next successful connect.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accepted.recv().await
    }

    /// Makes the next `n` connect attempts fail.
    pub fn refuse_next(&self, n: usize) {
        self.refusals.store(n, Ordering::SeqCst);
    }

    /// Connect attempts seen so far, refused ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

/// In-process connector. Every connect produces a [`MemoryPeer`] on the
/// paired [`MemoryServer`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    accepted: mpsc::UnboundedSender<MemoryPeer>,
    refusals: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
}

impl MemoryConnector {
    pub fn pair() -> (Self, MemoryServer) {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let refusals = Arc::new(AtomicUsize::new(0));
        let attempts = Arc::new(AtomicUsize::new(0));
        (
            Self {
                accepted: accepted_tx,
                refusals: Arc::clone(&refusals),
                attempts: Arc::clone(&attempts),
            },
            MemoryServer {
                accepted: accepted_rx,
                refusals,
                attempts,
            },
        )
    }
}

impl Connector for MemoryConnector {
    fn connect(&self) -> impl Future<Output = Result<Transport, TransportError>> + Send {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        let result = if refused {
            Err(TransportError::Connect("connection refused".to_string()))
        } else {
            let (client_tx, from_client) = mpsc::unbounded_channel::<String>();
            let (to_client, client_rx) = mpsc::unbounded_channel();
            let peer = MemoryPeer {
                from_client,
                to_client,
            };
            if self.accepted.send(peer).is_err() {
                Err(TransportError::Connect("memory server dropped".to_string()))
            } else {
                let sink = futures_util::sink::unfold(client_tx, |tx, text: String| async move {
                    tx.send(text)
                        .map_err(|_| TransportError::Io("peer hung up".to_string()))?;
                    Ok::<_, TransportError>(tx)
                });
                let stream = futures_util::stream::unfold(client_rx, |mut rx| async move {
                    rx.recv().await.map(|item| (item, rx))
                });
                Ok(Transport {
                    sink: Box::pin(sink),
                    stream: stream.boxed(),
                })
            }
        };
        future::ready(result)
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

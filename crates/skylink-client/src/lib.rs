//! Multiplexed WebSocket client and the `skylink` CLI.
//!
//! One socket carries many independent request/response calls and
//! long-lived event subscriptions. Calls are correlated by
//! `(protocol, sequence)`, subscriptions by `(protocol, messageType,
//! resource key)`. When the socket drops, in-flight calls fail with
//! [`ClientError::ConnectionLost`] while subscriptions survive: the client
//! reconnects with backoff and replays them.
//!
//! ```no_run
//! use skylink_client::{Client, ClientConfig, Payload};
//!
//! # async fn run() -> skylink_client::ClientResult<()> {
//! let client = Client::connect(ClientConfig::new("ws://localhost:8090/_websocket"))?;
//!
//! let reply = client.call(1, 1, Payload::new().with("instance", "simulator")).await?;
//! println!("{:?}", reply.data);
//!
//! let mut sub = client
//!     .subscribe(1, 5, Payload::new().with("parameter", "/YSS/SIMULATOR/BatteryVoltage2"))
//!     .await?;
//! while let Some(event) = sub.recv().await {
//!     println!("{}", event?.data);
//! }
//! # Ok(())
//! # }
//! ```

mod calls;
mod client;
mod connection;
mod engine;
mod message;
mod sequence;
mod subscriptions;

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod transport;

pub use cli::Cli;
pub use client::{CallOptions, Client, SubscribeOptions, Subscription};
pub use config::ClientConfig;
pub use connection::ConnectionState;
pub use error::{ClientError, ClientResult};
pub use message::{Event, Reply, SubscriptionId};
pub use sequence::{FIRST_SEQUENCE, SequenceAllocator};
pub use skylink_protocol::Payload;
pub use subscriptions::ResourceKey;

//! Command-line interface definition.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use skylink_protocol::Payload;

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};

/// skylink - calls and subscriptions over one multiplexed WebSocket
#[derive(Debug, Parser)]
#[command(name = "skylink")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, env = "SKYLINK_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Server endpoint (ws://, wss://, http:// or https://)
    #[arg(long, env = "SKYLINK_URL", global = true)]
    pub url: Option<String>,

    /// Extra handshake header as NAME=VALUE (can be repeated)
    #[arg(long = "header", short = 'H', value_parser = parse_key_value, action = clap::ArgAction::Append, global = true)]
    pub headers: Vec<(String, String)>,

    /// Enable debug output
    #[arg(long, short = 'v', global = true)]
    pub debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Applies command-line overrides on top of the loaded configuration.
    pub fn apply_overrides(&self, config: &mut ClientConfig) {
        if let Some(ref url) = self.url {
            config.connection.url = url.clone();
        }
        for (name, value) in &self.headers {
            config.connection.headers.insert(name.clone(), value.clone());
        }
        if self.debug {
            config.debug = true;
        }
    }
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Send one request and print the reply
    Call {
        /// Logical channel
        protocol: u32,

        /// Operation within the channel
        message_type: u32,

        /// Arguments as KEY=VALUE (can be repeated)
        #[arg(value_parser = parse_key_value)]
        args: Vec<(String, String)>,

        /// Arguments as a JSON object of strings, merged under KEY=VALUE ones
        #[arg(long)]
        json: Option<String>,

        /// Response timeout in milliseconds (0 waits forever)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Subscribe and print events as they arrive
    Subscribe {
        /// Logical channel
        protocol: u32,

        /// Subscribe message type
        message_type: u32,

        /// Arguments as KEY=VALUE (can be repeated)
        #[arg(value_parser = parse_key_value)]
        args: Vec<(String, String)>,

        /// Arguments as a JSON object of strings, merged under KEY=VALUE ones
        #[arg(long)]
        json: Option<String>,

        /// Payload field identifying the resource (can be repeated)
        #[arg(long = "key", action = clap::ArgAction::Append)]
        key_fields: Vec<String>,

        /// Message type used to unsubscribe
        #[arg(long)]
        unsubscribe_type: Option<u32>,

        /// Stop after this many events
        #[arg(long, short = 'n')]
        count: Option<usize>,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Configuration actions.
#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Dump current configuration
    Dump,

    /// Validate configuration
    Validate,

    /// Show configuration file path
    Path,
}

/// Parses `KEY=VALUE`.
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}

/// Builds a payload from an optional JSON object and `KEY=VALUE` pairs.
/// Pairs win over JSON fields of the same name.
pub fn build_payload(json: Option<&str>, args: &[(String, String)]) -> ClientResult<Payload> {
    let mut payload = match json {
        Some(text) => {
            let value: serde_json::Value = serde_json::from_str(text)
                .map_err(|e| ClientError::Encoding(format!("invalid --json argument: {e}")))?;
            Payload::from_json(value)?
        }
        None => Payload::new(),
    };
    for (key, value) in args {
        payload.insert(key.clone(), value.clone());
    }
    Ok(payload)
}

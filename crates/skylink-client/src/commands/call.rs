//! `skylink call`: one request, one reply.

use std::time::Duration;

use tracing::debug;

use crate::client::{CallOptions, Client};
use crate::config::ClientConfig;
use crate::error::ClientResult;
use crate::message::Reply;
use skylink_protocol::Payload;

/// Sends a single call and prints the reply as JSON.
pub async fn run(
    config: ClientConfig,
    protocol: u32,
    message_type: u32,
    payload: Payload,
    timeout_ms: Option<u64>,
) -> ClientResult<()> {
    let client = Client::connect(config)?;
    let options = match timeout_ms {
        Some(0) => CallOptions::no_timeout(),
        Some(ms) => CallOptions::timeout(Duration::from_millis(ms)),
        None => CallOptions::default(),
    };

    debug!(protocol, message_type, "sending call");
    let result = client
        .call_with(protocol, message_type, payload, options)
        .await;
    client.close().await?;

    println!("{}", render_reply(&result?));
    Ok(())
}

/// Renders a reply as a single JSON line.
pub fn render_reply(reply: &Reply) -> String {
    if reply.is_ack() {
        return "{}".to_string();
    }
    serde_json::json!({ "dt": reply.dt, "data": reply.data }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_ack_and_data() {
        assert_eq!(render_reply(&Reply::default()), "{}");

        let reply = Reply {
            dt: Some("INSTANCE".into()),
            data: Some(json!({ "name": "simulator" })),
            malformed: false,
        };
        assert_eq!(
            render_reply(&reply),
            r#"{"data":{"name":"simulator"},"dt":"INSTANCE"}"#
        );
    }
}

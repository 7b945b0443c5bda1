//! `skylink subscribe`: print events until interrupted.

use tracing::{Instrument, info, warn};

use crate::client::{Client, SubscribeOptions};
use crate::config::ClientConfig;
use crate::error::ClientResult;
use crate::message::Event;
use skylink_protocol::Payload;

/// What to subscribe to and how long to listen.
#[derive(Debug, Clone, Default)]
pub struct SubscribeArgs {
    pub protocol: u32,
    pub message_type: u32,
    pub payload: Payload,
    pub key_fields: Vec<String>,
    pub unsubscribe_type: Option<u32>,
    pub count: Option<usize>,
}

/// Subscribes and prints one JSON line per event. Stops after `count`
/// events, on Ctrl-C, or when the subscription ends.
pub async fn run(config: ClientConfig, args: SubscribeArgs) -> ClientResult<()> {
    let client = Client::connect(config)?;

    let mut options = SubscribeOptions::default();
    if !args.key_fields.is_empty() {
        options = options.key_fields(args.key_fields);
    }
    if let Some(t) = args.unsubscribe_type {
        options = options.unsubscribe_type(t);
    }

    let mut subscription = client
        .subscribe_with(args.protocol, args.message_type, args.payload, options)
        .await?;
    let span = subscription.span();
    span.in_scope(|| info!("subscribed"));

    let mut seen = 0usize;
    let outcome = async {
        loop {
            if args.count.is_some_and(|n| seen >= n) {
                break Ok(());
            }
            tokio::select! {
                item = subscription.recv() => match item {
                    Some(Ok(event)) => {
                        seen += 1;
                        println!("{}", render_event(&event));
                    }
                    Some(Err(e)) => break Err(e),
                    None => {
                        warn!("subscription ended");
                        break Ok(());
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupted");
                    break Ok(());
                }
            }
        }
    }
    .instrument(span)
    .await;

    subscription.cancel();
    client.close().await?;
    outcome
}

/// Renders an event as a single JSON line.
pub fn render_event(event: &Event) -> String {
    serde_json::json!({
        "seq": event.sequence,
        "dt": event.dt,
        "data": event.data,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_event_line() {
        let event = Event {
            dt: "PARAMETER".into(),
            data: json!({ "parameter": "X", "value": 1.5 }),
            sequence: 12,
            malformed: false,
        };
        assert_eq!(
            render_event(&event),
            r#"{"data":{"parameter":"X","value":1.5},"dt":"PARAMETER","seq":12}"#
        );
    }
}

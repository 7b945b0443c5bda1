//! The WebSocket transport against a loopback tokio-tungstenite server.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

use skylink_client::{Client, ClientConfig, ConnectionState, Payload};

/// Echoes every call's payload back. Message type 5 is a subscribe: it
/// gets a bare ack followed by one event.
async fn echo_server(listener: TcpListener, auth: oneshot::Sender<Option<String>>) {
    let (stream, _) = listener.accept().await.unwrap();
    let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        let header = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let _ = auth.send(header);
        Ok::<_, ErrorResponse>(resp)
    })
    .await
    .unwrap();

    let (mut sink, mut stream) = ws.split();
    while let Some(Ok(msg)) = stream.next().await {
        let Message::Text(text) = msg else { continue };
        let v: Value = serde_json::from_str(&text).unwrap();
        let response = if v[1] == 5 {
            json!([v[0], 0, v[2], {}])
        } else {
            json!([v[0], 0, v[2], { "dt": "ECHO", "data": v[3] }])
        };
        sink.send(Message::Text(response.to_string())).await.unwrap();
        if v[1] == 5 {
            let event = json!([1, 5, 900, { "dt": "PARAMETER", "data": v[3] }]);
            sink.send(Message::Text(event.to_string())).await.unwrap();
        }
    }
}

#[tokio::test]
async fn call_and_subscribe_over_websocket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (auth_tx, auth_rx) = oneshot::channel();
    tokio::spawn(echo_server(listener, auth_tx));

    let config = ClientConfig::new(format!("http://{addr}/_websocket"))
        .with_header("Authorization", "Bearer secret");
    let client = Client::connect(config).unwrap();
    tokio::time::timeout(Duration::from_secs(5), client.wait_for_open())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(auth_rx.await.unwrap().as_deref(), Some("Bearer secret"));

    let reply = client
        .call(1, 1, Payload::new().with("instance", "simulator"))
        .await
        .unwrap();
    assert_eq!(reply.dt.as_deref(), Some("ECHO"));
    assert_eq!(reply.data, Some(json!({ "instance": "simulator" })));

    let mut sub = client
        .subscribe(1, 5, Payload::new().with("parameter", "X"))
        .await
        .unwrap();
    let event = tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(event.sequence, 900);
    assert_eq!(event.data, json!({ "parameter": "X" }));

    client.close().await.unwrap();
    assert_eq!(client.connection_state(), ConnectionState::Closed);
}

#[tokio::test]
async fn unreachable_server_keeps_retrying() {
    // Bind then drop to get a port nothing listens on.
    let addr = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap();

    let client = Client::connect(ClientConfig::new(format!("ws://{addr}/"))).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_ne!(client.connection_state(), ConnectionState::Open);
    assert!(
        tokio::time::timeout(Duration::from_millis(200), client.wait_for_open())
            .await
            .is_err()
    );

    client.close().await.unwrap();
    assert_eq!(client.connection_state(), ConnectionState::Closed);
}

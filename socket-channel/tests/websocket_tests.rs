//! Integration tests for the websocket provider against a local server.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::json;
use socket_channel::{ChannelProvider, Frame, WebSocketConfig, WebSocketProvider};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;

/// Accept one connection, echo the first text message back, then close.
async fn spawn_echo_server() -> (String, tokio::task::JoinHandle<Option<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://{}/graphql", listener.local_addr().unwrap());

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut offered = None;
        let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            if let Some(protocol) = request.headers().get("sec-websocket-protocol") {
                offered = protocol.to_str().ok().map(str::to_string);
                response
                    .headers_mut()
                    .insert("sec-websocket-protocol", HeaderValue::from_static("graphql-ws"));
            }
            Ok(response)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback).await.unwrap();

        while let Some(Ok(message)) = ws.next().await {
            if let Message::Text(text) = message {
                ws.send(Message::Text(text)).await.unwrap();
                ws.close(None).await.unwrap();
                break;
            }
        }
        offered
    });

    (endpoint, server)
}

#[tokio::test]
async fn test_round_trip_over_websocket() {
    let (endpoint, server) = spawn_echo_server().await;
    let provider = WebSocketProvider::with_config(
        WebSocketConfig::default().with_connect_timeout(Duration::from_secs(2)),
    );

    let mut channel = provider.open(&endpoint).await.unwrap();
    channel
        .sender()
        .send_json(&json!({ "type": "connection_init", "payload": {} }))
        .await
        .unwrap();

    let frame = channel.next_frame().await.unwrap().unwrap();
    let echoed: serde_json::Value = serde_json::from_str(frame.as_text().unwrap()).unwrap();
    assert_eq!(echoed, json!({ "type": "connection_init", "payload": {} }));

    // Server closes after the echo
    match channel.next_frame().await {
        Some(Ok(Frame::Close)) | None => {}
        other => panic!("Expected close, got {:?}", other),
    }

    assert_eq!(server.await.unwrap().as_deref(), Some("graphql-ws"));
}

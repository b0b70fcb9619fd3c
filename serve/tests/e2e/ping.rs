use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::common;

#[tokio::test]
async fn ping_gets_a_pong_back() {
    let harness = common::spawn().await;
    let (mut socket, _response) = tokio_tungstenite::connect_async(harness.ws_url("conv-ping"))
        .await
        .expect("the handshake should succeed with a valid bearer token");

    let envelope = conveyor_core::protocol::ProtocolMessage::new("system.ping", serde_json::json!({}));
    let text = serde_json::to_string(&envelope).unwrap();
    socket.send(WsMessage::Text(text)).await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("should receive a reply before the timeout")
        .expect("stream should not end")
        .expect("frame should parse");

    let WsMessage::Text(reply_text) = reply else {
        panic!("expected a text frame, got {reply:?}");
    };
    let parsed: serde_json::Value = serde_json::from_str(&reply_text).unwrap();
    assert_eq!(parsed["type"], "system.pong");
}

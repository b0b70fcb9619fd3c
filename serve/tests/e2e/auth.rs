use std::time::Duration;

use futures_util::StreamExt;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::common;

#[tokio::test]
async fn bad_token_closes_with_auth_failure() {
    let harness = common::spawn().await;
    let url = format!("ws://{}/ws?token=not-a-real-jwt&conversationId=conv-auth", harness.ws_addr);
    let (mut socket, _response) = tokio_tungstenite::connect_async(url).await.expect("the upgrade itself still succeeds");

    let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("should receive a close frame before the timeout")
        .expect("stream should not end")
        .expect("frame should parse");

    match frame {
        WsMessage::Close(Some(close_frame)) => assert_eq!(u16::from(close_frame.code), 1008),
        other => panic!("expected a close frame with code 1008, got {other:?}"),
    }
}

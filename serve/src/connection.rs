//! WebSocket connection lifecycle: handshake, heartbeat, and the recv loop
//! that feeds the shared [`MessageRouter`] (spec §4.6, §6, §7).

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;

use conveyor_core::connection::{Connection, ConnectionState};
use conveyor_core::context::ConversationContext;
use conveyor_core::protocol::{CloseCode, ProtocolMessage};

use crate::app::{AppState, WsQuery};

pub(crate) async fn handle_socket(socket: WebSocket, query: WsQuery, state: Arc<AppState>) {
    let claims = match state.jwt_verifier.verify(&query.token).await {
        Ok(claims) => claims,
        Err(e) => {
            tracing::warn!(error = %e, "rejecting websocket: token verification failed");
            close_with(socket, CloseCode::AuthFailure, &e.to_string()).await;
            return;
        }
    };

    let claims_value = serde_json::to_value(&claims).unwrap_or(serde_json::Value::Null);
    if let Err(e) = state.access_resolver.resolve_groups(&claims_value).await {
        tracing::warn!(error = %e, "rejecting websocket: access resolution failed");
        close_with(socket, CloseCode::AuthFailure, &e.to_string()).await;
        return;
    }

    let mut connection = Connection::new(claims.sub.clone());
    connection.access_token = Some(query.token.clone());
    connection.conversation_id = Some(query.conversation_id.clone());
    connection.definition_id = query.definition_id.clone();

    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::unbounded_channel();
    let connection_id = state.connections.register(connection, outbound_tx);
    state.connections.bind_conversation(connection_id, query.conversation_id.clone());

    state.connections.transition(connection_id, ConnectionState::Connected).await;
    state.connections.transition(connection_id, ConnectionState::Authenticated).await;
    state.connections.transition(connection_id, ConnectionState::Active).await;

    let ctx: conveyor_core::orchestrator::SharedContext = Arc::new(Mutex::new(ConversationContext::new(
        connection_id,
        query.conversation_id.clone(),
        false,
        query.definition_id.is_some(),
    )));

    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(t) => t,
                Err(e) => {
                    tracing::error!(error = %e, "failed to serialize outbound protocol message");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let heartbeat = state
        .connections
        .clone()
        .spawn_heartbeat(connection_id, state.config.heartbeat.ping_interval, state.config.heartbeat.max_missed_pongs);

    while let Some(res) = stream.next().await {
        let msg = match res {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "websocket read error, closing connection");
                break;
            }
        };

        let text = match msg {
            Message::Text(t) => t,
            Message::Binary(b) => String::from_utf8_lossy(&b).into_owned(),
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        let envelope: ProtocolMessage = match serde_json::from_str(&text) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed envelope");
                continue;
            }
        };

        let Some(connection_arc) = state.connections.get(connection_id) else {
            break;
        };
        let connection_snapshot = connection_arc.lock().await.clone();

        if let Err(err) = state.router.route(&connection_snapshot, &ctx, &envelope).await {
            tracing::warn!(error = %err, conversation_id = %query.conversation_id, "router rejected message");
            state.connections.send_to_connection(connection_id, error_frame(err)).await.ok();
        }
    }

    heartbeat.abort();
    writer.abort();
    state.connections.unregister(connection_id);
}

fn error_frame(err: conveyor_core::router::RouterError) -> ProtocolMessage {
    let system_error = err.into_system_error();
    ProtocolMessage::new("system.error", serde_json::to_value(system_error).unwrap_or(serde_json::Value::Null))
}

async fn close_with(mut socket: WebSocket, code: CloseCode, reason: &str) {
    let frame = CloseFrame { code: code.as_u16(), reason: reason.to_string().into() };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

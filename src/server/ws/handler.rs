//! WebSocket adapter for the event bus, grounded on the teacher's
//! `server/ws/handler.rs` (split sender/receiver, `mpsc` relay, a select
//! loop for inbound frames vs. outbound bus messages) but speaking the
//! subscribe/unsubscribe/ping protocol from spec.md §6 instead of chat.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use uuid::Uuid;

use crate::events::{envelope, topics};
use crate::state::AppState;

use super::protocol::WsIncomingMessage;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let client_id = Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();

    let mut outgoing = state.events.register(client_id.clone(), Vec::<String>::new()).await;

    let _ = sender
        .send(Message::Text(
            envelope(topics::CONNECTED, json!({ "client_id": client_id })).to_string(),
        ))
        .await;

    let relay_client_id = client_id.clone();
    let relay = tokio::spawn(async move {
        while let Some(message) = outgoing.recv().await {
            if sender.send(Message::Text(message.to_string())).await.is_err() {
                tracing::debug!(client_id = %relay_client_id, "subscriber disconnected mid-broadcast");
                break;
            }
        }
    });

    while let Some(Ok(message)) = receiver.next().await {
        match message {
            Message::Text(text) => handle_incoming(&state, &client_id, &text).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    relay.abort();
    state.events.deregister(&client_id).await;
}

async fn handle_incoming(state: &Arc<AppState>, client_id: &str, text: &str) {
    let incoming: WsIncomingMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(_) => {
            state.events.send_to_client(
                client_id,
                envelope(topics::ERROR, json!({ "message": "malformed message" })),
            ).await;
            return;
        }
    };

    match incoming.msg_type.as_str() {
        "subscribe" => {
            state.events.subscribe(client_id, incoming.channels.clone()).await;
            state
                .events
                .send_to_client(
                    client_id,
                    envelope(topics::SUBSCRIBED, json!({ "channels": incoming.channels })),
                )
                .await;
        }
        "unsubscribe" => {
            state.events.unsubscribe(client_id, incoming.channels.clone()).await;
            state
                .events
                .send_to_client(
                    client_id,
                    envelope(topics::UNSUBSCRIBED, json!({ "channels": incoming.channels })),
                )
                .await;
        }
        "ping" => {
            state
                .events
                .send_to_client(client_id, envelope(topics::PONG, json!({})))
                .await;
        }
        "get_subscriptions" => {
            let channels = state.events.subscriptions(client_id).await;
            state
                .events
                .send_to_client(client_id, envelope(topics::SUBSCRIPTIONS, json!({ "channels": channels })))
                .await;
        }
        other => {
            state
                .events
                .send_to_client(
                    client_id,
                    envelope(topics::ERROR, json!({ "message": format!("unknown message type '{}'", other) })),
                )
                .await;
        }
    }
}

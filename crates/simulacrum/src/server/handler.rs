//! WebSocket Connection Handler
//!
//! Handles individual WebSocket connections and message processing. Each
//! connection is one subscriber of the process's routing table.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use simulacrum_runtime::{ChannelValue, SubscriberHandle};

use super::protocol::{ClientMessage, ErrorCode, ServerMessage};
use super::state::AppState;

/// Pending updates per client before the table starts dropping them
const UPDATE_QUEUE: usize = 256;

/// Handle a WebSocket connection
pub async fn handle_websocket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Create channel for sending messages to this client
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(64);
    let (subscriber, mut updates) = SubscriberHandle::channel(UPDATE_QUEUE);
    let subscriber_id = subscriber.id;

    let session_id = state.register_client(tx, subscriber);

    let connected_msg = ServerMessage::connected(session_id.to_string(), state.process());
    if let Ok(json) = serde_json::to_string(&connected_msg) {
        let _ = ws_sender.send(Message::Text(json)).await;
    }

    // Forward responses and subscription updates to the WebSocket
    let send_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                Some(msg) = rx.recv() => msg,
                Some(update) = updates.recv() => ServerMessage::from(update),
                else => break,
            };
            if let Ok(json) = serde_json::to_string(&msg) {
                if ws_sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
    });

    // Process incoming messages
    let state_clone = state.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    handle_client_message(&state_clone, session_id, &text).await;
                }
                Message::Close(_) => {
                    break;
                }
                Message::Ping(_data) => {
                    // Pong is handled automatically by axum
                    tracing::trace!(session_id = %session_id, "Received ping");
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    // Cleanup
    state.remove_client(session_id);
    if let Err(e) = state.pv().drop_subscriber(subscriber_id).await {
        tracing::debug!(session_id = %session_id, error = %e, "Could not drop subscriptions");
    }
}

/// Handle a client message
async fn handle_client_message(state: &AppState, session_id: Uuid, text: &str) {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to parse client message");
            send_error(state, session_id, None, ErrorCode::InvalidRequest, "Invalid JSON").await;
            return;
        }
    };

    let response = match msg {
        ClientMessage::Get { id, name } => handle_get(state, &id, &name).await,
        ClientMessage::Put { id, name, value } => handle_put(state, &id, &name, value).await,
        ClientMessage::Subscribe { id, names } => handle_subscribe(state, session_id, &id, names).await,
        ClientMessage::Unsubscribe { id, names } => handle_unsubscribe(state, session_id, &id, names).await,
        ClientMessage::Ping { id } => ServerMessage::pong(id),
    };
    send_to_client(state, session_id, response).await;
}

async fn handle_get(state: &AppState, id: &str, name: &str) -> ServerMessage {
    match state.pv().read(name).await {
        Ok(value) => ServerMessage::success(id, Some(value.into())),
        Err(e) => ServerMessage::routing_error(id, &e),
    }
}

async fn handle_put(state: &AppState, id: &str, name: &str, value: ChannelValue) -> ServerMessage {
    tracing::debug!(name = %name, value = %value, "Put request");
    match state.pv().write(name, value).await {
        Ok(stored) => ServerMessage::success(id, Some(stored.into())),
        Err(e) => ServerMessage::routing_error(id, &e),
    }
}

/// Subscribe to each name and reply with their current values
async fn handle_subscribe(state: &AppState, session_id: Uuid, id: &str, names: Vec<String>) -> ServerMessage {
    let Some(subscriber) = state.subscriber(session_id) else {
        return ServerMessage::error_response(id, ErrorCode::InternalError, "Unknown session");
    };

    let mut initial = Map::new();
    for name in names {
        match state.pv().subscribe(name.clone(), subscriber.clone()).await {
            Ok(value) => {
                initial.insert(name, value.into());
            }
            Err(e) => return ServerMessage::routing_error(id, &e),
        }
    }
    ServerMessage::success(id, Some(Value::Object(initial)))
}

async fn handle_unsubscribe(state: &AppState, session_id: Uuid, id: &str, names: Vec<String>) -> ServerMessage {
    let Some(subscriber) = state.subscriber(session_id) else {
        return ServerMessage::error_response(id, ErrorCode::InternalError, "Unknown session");
    };

    let mut removed = Map::new();
    for name in names {
        match state.pv().unsubscribe(name.clone(), subscriber.id).await {
            Ok(was_subscribed) => {
                removed.insert(name, Value::Bool(was_subscribed));
            }
            Err(e) => return ServerMessage::routing_error(id, &e),
        }
    }
    ServerMessage::success(id, Some(Value::Object(removed)))
}

/// Send an error message to a client
async fn send_error(
    state: &AppState,
    session_id: Uuid,
    id: Option<String>,
    code: ErrorCode,
    message: impl Into<String>,
) {
    let msg = ServerMessage::Error {
        id,
        code,
        message: message.into(),
    };
    send_to_client(state, session_id, msg).await;
}

/// Send a message to a specific client
async fn send_to_client(state: &AppState, session_id: Uuid, msg: ServerMessage) {
    state.send_to(session_id, msg).await;
}

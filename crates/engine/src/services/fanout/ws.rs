//! Axum WebSocket endpoint for the fan-out layer.
//!
//! Outbound messages flow through a per-subscriber mpsc queue so the registry
//! never blocks on a slow socket; a forwarder task drains the queue onto the
//! sink and exits when the queue closes.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::Fanout;
use crate::wire::{ClientAction, ClientMessage, ServerMessage};

/// Mount the fan-out WebSocket endpoint at `path`.
pub fn mount(fanout: Arc<Fanout>, router: axum::Router, path: &str) -> axum::Router {
    router.route(path, axum::routing::get(upgrade).with_state(fanout))
}

async fn upgrade(ws: WebSocketUpgrade, State(fanout): State<Arc<Fanout>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, fanout))
}

async fn handle_socket(socket: WebSocket, fanout: Arc<Fanout>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(fanout.config.outbound_buffer);

    let id = fanout.register(tx);
    fanout.send_to(
        &id,
        ServerMessage::new("connection", json!({ "clientId": id })),
    );

    let forwarder = {
        let fanout = fanout.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to serialize outbound message: {e}");
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
                // A completed write proves the socket still accepts data;
                // queueing alone does not.
                fanout.touch(&id);
            }
            let _ = sink.close().await;
        })
    };

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => handle_client_message(&fanout, &id, text.as_str()),
            Ok(Message::Pong(_)) => fanout.touch(&id),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Subscriber {id} socket error: {e}");
                break;
            }
        }
    }

    fanout.remove(&id);
    forwarder.abort();
}

fn handle_client_message(fanout: &Fanout, id: &uuid::Uuid, text: &str) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            // Malformed control messages are logged and ignored, never fatal
            // to the connection.
            debug!("Subscriber {id} sent unparseable message: {e}");
            return;
        }
    };

    match (message.action, message.channel_key) {
        (ClientAction::Subscribe, Some(key)) => fanout.subscribe(id, key),
        (ClientAction::Unsubscribe, Some(key)) => fanout.unsubscribe(id, &key),
        (ClientAction::Ping, _) => {
            fanout.touch(id);
            fanout.send_to(id, ServerMessage::new("pong", json!(null)));
        }
        (action, None) => {
            debug!("Subscriber {id} sent {action:?} without a channelKey");
        }
    }
}

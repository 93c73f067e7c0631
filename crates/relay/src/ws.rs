//! WebSocket endpoint for deployment notifications.
//!
//! Observers connect, receive broadcast messages, and disconnect. There is
//! no client-to-server protocol beyond the connection itself.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tracing::debug;

use crate::broadcast::Broadcaster;

/// Build the router for the notification listener.
pub fn ws_router(broadcaster: Arc<Broadcaster>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(broadcaster)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(broadcaster): State<Arc<Broadcaster>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, broadcaster))
}

async fn handle_socket(socket: WebSocket, broadcaster: Arc<Broadcaster>) {
    let (mut sink, mut stream) = socket.split();
    let (id, mut rx) = broadcaster.subscribe();
    debug!(subscriber = id, "Notification observer connected");

    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                // Inbound frames are ignored.
                Some(Ok(_)) => {}
            },
        }
    }

    broadcaster.unsubscribe(id);
    debug!(subscriber = id, "Notification observer disconnected");
}

//! The observer websocket: a push stream of task events.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tracing::debug;

use super::AppState;

pub async fn observe(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (observer_id, mut events) = state.hub.attach();
    debug!(observer_id, "observer connected");

    let (mut sender, mut receiver) = socket.split();

    // Forward hub events until the hub drops us or the socket dies.
    let forward = tokio::spawn(async move {
        while let Some(message) = events.recv().await {
            if sender.send(Message::Text(message)).await.is_err() {
                break;
            }
        }
    });

    // Inbound frames are keep-alives; drain them until the peer goes away.
    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    state.hub.detach(observer_id);
    forward.abort();
    debug!(observer_id, "observer disconnected");
}

//! Media channel WebSocket
//!
//! Each connection is one call. Inbound envelopes drive a [`CallSession`];
//! the session's outbound media messages are written back on the same socket.
//! The socket closing is the only termination signal.

use super::handlers::AppState;
use crate::application::CallSession;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

pub async fn media_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();

    let session = CallSession::new(state.context.clone(), outbound_tx);
    let session_id = session.id();
    state.sessions.register(session.clone());
    info!(session_id = %session_id, "Media channel connected");

    let mut send_task = tokio::spawn(async move {
        while let Some(json) = outbound_rx.recv().await {
            if sender.send(Message::Text(json)).await.is_err() {
                debug!(session_id = %session_id, "Failed to write to media channel");
                break;
            }
        }
    });

    let inbound = session.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => inbound.handle_message(&text).await,
                Message::Close(_) => {
                    debug!(session_id = %session_id, "Received close message");
                    break;
                }
                Message::Binary(_) => {
                    debug!(session_id = %session_id, "Received binary message (ignored)");
                }
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    }

    session.close().await;
    state.sessions.remove(session_id);
    info!(session_id = %session_id, "Media channel disconnected");
}

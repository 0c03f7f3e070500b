use futures_util::sink::SinkExt;
use futures_util::stream::StreamExt;
use log::{debug, error, info};
use tokio::sync::mpsc;
use uuid::Uuid;
use warp::ws::WebSocket;

use crate::core::{EventDispatcher, SharedRelayManager};

// Handle a WebSocket connection
pub async fn handle_ws_client(ws: WebSocket, server: SharedRelayManager) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (tx, rx) = mpsc::unbounded_channel();

    // Spawn a task to forward messages from our channel to the WebSocket
    tokio::task::spawn(async move {
        let mut rx = rx;
        while let Some(message) = rx.recv().await {
            if let Err(e) = ws_tx.send(message).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
    });

    // Anonymous by design: the only server-side identity is a fresh
    // per-connection id
    let connection_id = Uuid::new_v4().to_string();
    server.attach_connection(&connection_id, tx).await;
    info!("Client connected");
    debug!("Connection attached: {}", connection_id);

    let dispatcher = EventDispatcher::new(server.clone());

    // Handle incoming frames sequentially, preserving per-connection order
    while let Some(result) = ws_rx.next().await {
        match result {
            Ok(msg) => {
                if msg.is_close() {
                    break;
                }
                // Only process text frames
                if msg.is_text() {
                    if let Ok(text) = msg.to_str() {
                        dispatcher.handle_message(&connection_id, text).await;
                    }
                }
            }
            Err(e) => {
                debug!("WebSocket connection error: {}", e);
                break;
            }
        }
    }

    // Cleanup on disconnect. A connection whose session was taken over
    // finds its binding already nulled and cleans up nothing.
    if let Err(e) = server.disconnect(&connection_id).await {
        debug!("Cleanup error for connection {}: {}", connection_id, e);
    } else {
        info!("Client disconnected");
        debug!("Connection detached: {}", connection_id);
    }
}

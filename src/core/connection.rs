//! Live connection management
//! Tracks the node-local transport attachments and their session bindings

use log::{debug, warn};
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use warp::ws::Message as WsMessage;

/// A single live bidirectional attachment
pub struct ConnectionHandle {
    pub id: String,
    pub sender: mpsc::UnboundedSender<WsMessage>,
    /// The session currently bound to this connection. Nulled before a
    /// force-close so the closing socket's cleanup does not touch a
    /// session that was taken over.
    pub session_id: Option<String>,
    pub connected_at: Instant,
}

impl ConnectionHandle {
    pub fn new(id: String, sender: mpsc::UnboundedSender<WsMessage>) -> Self {
        Self {
            id,
            sender,
            session_id: None,
            connected_at: Instant::now(),
        }
    }

    /// Send a text frame; failures mean the peer is gone and are dropped
    pub fn send_text(&self, text: &str) -> bool {
        match self.sender.send(WsMessage::text(text)) {
            Ok(_) => true,
            Err(_) => {
                warn!("Failed to send frame to connection {}", self.id);
                false
            }
        }
    }
}

/// Node-local registry of live connections
pub struct ConnectionTable {
    connections: RwLock<HashMap<String, ConnectionHandle>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, handle: ConnectionHandle) {
        debug!("Connection attached: {}", handle.id);
        self.connections.write().await.insert(handle.id.clone(), handle);
    }

    /// Detach a connection, returning its session binding at removal time
    pub async fn remove(&self, connection_id: &str) -> Option<Option<String>> {
        let removed = self.connections.write().await.remove(connection_id);
        removed.map(|handle| {
            debug!("Connection detached: {}", connection_id);
            handle.session_id
        })
    }

    pub async fn contains(&self, connection_id: &str) -> bool {
        self.connections.read().await.contains_key(connection_id)
    }

    /// Deliver a text frame to a locally-attached connection
    pub async fn send_to(&self, connection_id: &str, text: &str) -> bool {
        match self.connections.read().await.get(connection_id) {
            Some(handle) => handle.send_text(text),
            None => false,
        }
    }

    pub async fn bind_session(&self, connection_id: &str, session_id: &str) {
        if let Some(handle) = self.connections.write().await.get_mut(connection_id) {
            handle.session_id = Some(session_id.to_string());
        }
    }

    pub async fn session_of(&self, connection_id: &str) -> Option<String> {
        self.connections
            .read()
            .await
            .get(connection_id)
            .and_then(|handle| handle.session_id.clone())
    }

    /// Null the session binding and push a close frame. The socket task
    /// sees the close, winds down, and finds no session to clean up.
    pub async fn force_close(&self, connection_id: &str) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get_mut(connection_id) {
            Some(handle) => {
                handle.session_id = None;
                let _ = handle.sender.send(WsMessage::close());
                true
            }
            None => false,
        }
    }
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}

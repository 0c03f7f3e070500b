//! Integrated relay service that coordinates sessions, matchmaking,
//! invites and fan-out

use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::time::interval;
use warp::ws::Message as WsMessage;

use crate::constants::{SESSION_TTL_SECS, SWEEP_INTERVAL_SECS};
use crate::core::connection::{ConnectionHandle, ConnectionTable};
use crate::core::events::ServerEvent;
use crate::core::invite::InviteIssuer;
use crate::core::matchmaker::Matchmaker;
use crate::core::rate_limiter::MessageBudget;
use crate::core::session::SessionRegistry;
use crate::error::Result;
use crate::storage::{PeerFrame, SessionRecord, SharedBackend};

/// Health counters exposed by the admin surface. No identifiers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStats {
    pub active_sessions: usize,
    pub waiting_in_queue: usize,
    pub active_rooms: usize,
    /// Which state backend the relay runs over
    pub backend_kind: &'static str,
}

/// Coordinates every component of the relay over one state backend
pub struct RelayManager {
    backend: SharedBackend,
    connections: ConnectionTable,
    sessions: SessionRegistry,
    matchmaker: Matchmaker,
    invites: InviteIssuer,
    budget: MessageBudget,
    started_at: Instant,
}

impl RelayManager {
    pub fn new(backend: SharedBackend) -> Self {
        Self {
            connections: ConnectionTable::new(),
            sessions: SessionRegistry::new(backend.clone()),
            matchmaker: Matchmaker::new(backend.clone()),
            invites: InviteIssuer::new(backend.clone()),
            budget: MessageBudget::new(backend.clone()),
            backend,
            started_at: Instant::now(),
        }
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn matchmaker(&self) -> &Matchmaker {
        &self.matchmaker
    }

    pub fn invites(&self) -> &InviteIssuer {
        &self.invites
    }

    pub fn budget(&self) -> &MessageBudget {
        &self.budget
    }

    /// Attach a live connection under a server-assigned id
    pub async fn attach_connection(
        &self,
        connection_id: &str,
        sender: mpsc::UnboundedSender<WsMessage>,
    ) {
        self.connections
            .insert(ConnectionHandle::new(connection_id.to_string(), sender))
            .await;
    }

    /// Emit an event to a connection, wherever it is attached. Local
    /// delivery is direct; otherwise the frame goes over the fan-out
    /// channel for whichever node holds the connection. Best-effort:
    /// a vanished peer just drops the frame.
    pub async fn emit(&self, connection_id: &str, event: &ServerEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize server event: {}", e);
                return;
            }
        };
        if self.connections.send_to(connection_id, &payload).await {
            return;
        }
        let frame = PeerFrame::Deliver {
            connection_id: connection_id.to_string(),
            payload,
        };
        if let Err(e) = self.backend.publish(frame).await {
            debug!("Dropped undeliverable frame for {}: {}", connection_id, e);
        }
    }

    pub async fn emit_error(&self, connection_id: &str, message: &str) {
        self.emit(
            connection_id,
            &ServerEvent::Error {
                message: message.to_string(),
            },
        )
        .await;
    }

    /// Close a connection without letting it clean up its session. The
    /// binding is nulled before the close frame goes out, so the closing
    /// socket's disconnect path finds nothing to tear down.
    pub async fn force_close(&self, connection_id: &str) {
        if self.connections.force_close(connection_id).await {
            return;
        }
        let frame = PeerFrame::ForceClose {
            connection_id: connection_id.to_string(),
        };
        if let Err(e) = self.backend.publish(frame).await {
            debug!("Failed to publish force-close for {}: {}", connection_id, e);
        }
    }

    /// Register a session on a connection. A prior holder of the same
    /// session id is detached, force-closed and cascaded away first.
    pub async fn register_session(&self, connection_id: &str, session_id: &str) -> Result<()> {
        if let Some(existing) = self.sessions.get_session(session_id).await? {
            if existing.connection_id != connection_id {
                debug!("Session {} taken over by a new connection", session_id);
                self.force_close(&existing.connection_id).await;
                self.cascade_cleanup(&existing).await?;
            }
        }
        self.sessions.add_session(session_id, connection_id).await?;
        self.connections.bind_session(connection_id, session_id).await;
        Ok(())
    }

    /// Leave whatever room the session is in: notify the peer, tear the
    /// room down. Returns whether a room existed. Safe to repeat.
    pub async fn leave_current_room(&self, session_id: &str) -> Result<bool> {
        let Some(room_id) = self.matchmaker.room_for_session(session_id).await? else {
            return Ok(false);
        };
        let Some(room) = self.matchmaker.get_room(&room_id).await? else {
            return Ok(false);
        };
        if let Some((_, peer_connection)) =
            self.matchmaker.peer_connection(&room_id, session_id).await?
        {
            self.emit(
                &peer_connection,
                &ServerEvent::ChatEnded {
                    reason: "The other person has left.".to_string(),
                },
            )
            .await;
        }
        self.matchmaker.destroy_room(&room_id).await?;
        // The next chat starts with a fresh message budget on both sides
        self.budget.clear(&room.session1.session_id).await?;
        self.budget.clear(&room.session2.session_id).await?;
        Ok(true)
    }

    /// The fixed cleanup sequence run whenever a session leaves for any
    /// reason: dequeue, cancel invite, notify peer and destroy room,
    /// clear the rate counter, drop the session. Idempotent.
    pub async fn cascade_cleanup(&self, record: &SessionRecord) -> Result<()> {
        let session_id = &record.session_id;
        self.matchmaker.leave_queue(session_id).await?;
        self.invites.cancel(session_id).await?;
        self.leave_current_room(session_id).await?;
        self.budget.clear(session_id).await?;
        self.sessions.remove_session(session_id).await?;
        Ok(())
    }

    /// Transport-originated disconnect. A connection whose session was
    /// taken over (binding nulled, or the registry already points at a
    /// newer connection) cleans up nothing.
    pub async fn disconnect(&self, connection_id: &str) -> Result<()> {
        let Some(binding) = self.connections.remove(connection_id).await else {
            return Ok(());
        };
        let Some(session_id) = binding else {
            return Ok(());
        };
        let Some(record) = self.sessions.get_session(&session_id).await? else {
            return Ok(());
        };
        if record.connection_id != connection_id {
            debug!("Skipping cleanup for superseded connection {}", connection_id);
            return Ok(());
        }
        self.cascade_cleanup(&record).await
    }

    /// One sweep pass: cascade every session idle past the TTL through
    /// the normal cleanup path. Returns how many were expired.
    pub async fn expire_stale_sessions(&self, ttl_secs: i64) -> Result<usize> {
        let expired = self.sessions.expired_sessions(ttl_secs).await?;
        let count = expired.len();
        if count > 0 {
            info!("Expiring {} idle sessions", count);
        }
        for record in expired {
            self.force_close(&record.connection_id).await;
            if let Err(e) = self.cascade_cleanup(&record).await {
                warn!("Failed to expire session: {}", e);
            }
        }
        Ok(count)
    }

    /// Start the periodic expiry sweeper
    pub fn start_sweeper(self: &Arc<Self>) {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
            loop {
                ticker.tick().await;
                if let Err(e) = server.expire_stale_sessions(SESSION_TTL_SECS).await {
                    error!("Expiry sweep failed: {}", e);
                }
            }
        });
    }

    /// Start the node-local delivery loop draining the fan-out channel
    pub fn start_delivery_loop(self: &Arc<Self>) {
        let server = Arc::clone(self);
        let mut frames = self.backend.subscribe();
        tokio::spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(PeerFrame::Deliver {
                        connection_id,
                        payload,
                    }) => {
                        // Frames for connections on other nodes are not ours
                        server.connections.send_to(&connection_id, &payload).await;
                    }
                    Ok(PeerFrame::ForceClose { connection_id }) => {
                        server.connections.force_close(&connection_id).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Delivery loop lagged; dropped {} frames", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    pub async fn stats(&self) -> Result<RelayStats> {
        Ok(RelayStats {
            active_sessions: self.sessions.session_count().await?,
            waiting_in_queue: self.matchmaker.queue_len().await?,
            active_rooms: self.matchmaker.room_count().await?,
            backend_kind: self.backend.kind(),
        })
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

// Shared reference to the relay manager
pub type SharedRelayManager = Arc<RelayManager>;

//! Abstract state-backend interface for pluggable coordination state
//!
//! All coordination state (sessions, queue, invites, rooms, rate counters)
//! lives behind this trait so the relay can run either process-local or
//! against a shared Redis deployment without the upper layers caring.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::Result;

/// An anonymous participant. The session id is chosen by the client; the
/// connection id is assigned by the server per live attachment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub connection_id: String,
    pub room_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// A pending one-time invite code
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteRecord {
    pub session_id: String,
    pub connection_id: String,
    pub created_at: DateTime<Utc>,
}

/// One end of a room pairing, frozen at pairing time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMember {
    pub session_id: String,
    pub connection_id: String,
}

/// A strictly 2-party pairing keyed by a server-minted UUID
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRecord {
    pub room_id: String,
    pub session1: RoomMember,
    pub session2: RoomMember,
}

impl RoomRecord {
    /// The member tuple for the other side of the room, if the given
    /// session is a member at all.
    pub fn peer_of(&self, session_id: &str) -> Option<&RoomMember> {
        if self.session1.session_id == session_id {
            Some(&self.session2)
        } else if self.session2.session_id == session_id {
            Some(&self.session1)
        } else {
            None
        }
    }
}

/// Fixed-window rate counter state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateWindow {
    pub count: u32,
    /// Window start as epoch milliseconds
    pub window_start: i64,
}

/// Frames carried on the fan-out channel. In shared mode these traverse
/// Redis pub/sub so a peer attached to another node still receives them;
/// each node delivers only to connection ids it holds locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PeerFrame {
    /// Deliver a serialized server event to one connection
    Deliver {
        connection_id: String,
        payload: String,
    },
    /// Close a connection without running its session cleanup
    ForceClose { connection_id: String },
}

/// Capability set shared by both backends. Operations are async in both
/// modes; the local backend resolves immediately.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Short name of the backing store, for the admin surface
    fn kind(&self) -> &'static str;

    // --- sessions ---

    /// Upsert a session record
    async fn put_session(&self, record: SessionRecord) -> Result<()>;

    /// Fetch a session by id
    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>>;

    /// Reset a session's last-seen timestamp; no-op if missing
    async fn touch_session(&self, session_id: &str) -> Result<()>;

    /// Bind a session to a room; no-op if missing
    async fn set_session_room(&self, session_id: &str, room_id: &str) -> Result<()>;

    /// Clear a session's room binding; no-op if missing
    async fn clear_session_room(&self, session_id: &str) -> Result<()>;

    /// Delete a session record
    async fn remove_session(&self, session_id: &str) -> Result<()>;

    async fn session_count(&self) -> Result<usize>;

    /// Sessions whose last activity is older than the TTL. Records are
    /// left in place; the caller drives the cleanup cascade, which is
    /// idempotent if a sweep repeats.
    async fn expired_sessions(&self, ttl_secs: i64) -> Result<Vec<SessionRecord>>;

    // --- matchmaking queue ---

    /// Append a session to the waiting queue
    async fn queue_push(&self, session_id: &str) -> Result<()>;

    /// Pop the oldest waiter, skipping entries already cancelled out of
    /// the membership set
    async fn queue_pop(&self) -> Result<Option<String>>;

    /// Remove all occurrences of a session from the queue
    async fn queue_remove(&self, session_id: &str) -> Result<()>;

    async fn queue_contains(&self, session_id: &str) -> Result<bool>;

    async fn queue_len(&self) -> Result<usize>;

    // --- invites ---

    /// Insert an invite only if the code is free. Writes the reverse
    /// index with the same TTL. Returns false on collision.
    async fn invite_insert(
        &self,
        code: &str,
        record: InviteRecord,
        ttl_secs: i64,
    ) -> Result<bool>;

    /// Read and delete an invite (single use). Expired or missing codes
    /// return None.
    async fn invite_take(&self, code: &str) -> Result<Option<InviteRecord>>;

    /// Reverse lookup: the active code held by a session, if any
    async fn invite_code_for_session(&self, session_id: &str) -> Result<Option<String>>;

    /// Delete a session's invite and its reverse index. Returns whether
    /// an invite existed.
    async fn invite_remove_for_session(&self, session_id: &str) -> Result<bool>;

    // --- rooms ---

    /// Install a room: record, room set, both reverse indices and both
    /// session bindings as one logical transaction.
    async fn install_room(&self, record: RoomRecord) -> Result<()>;

    async fn get_room(&self, room_id: &str) -> Result<Option<RoomRecord>>;

    /// Reverse lookup: the room a session is bound to, if any
    async fn room_for_session(&self, session_id: &str) -> Result<Option<String>>;

    /// Tear a room down: record, room set, both reverse indices and both
    /// session bindings. Idempotent.
    async fn remove_room(&self, room_id: &str) -> Result<()>;

    async fn room_count(&self) -> Result<usize>;

    // --- rate limiting ---

    /// Record a message against the session's fixed window. Returns
    /// whether the message is allowed. The shared backend's
    /// read-modify-write is not transactional; small overshoot is
    /// acceptable for a courtesy limit.
    async fn rate_hit(&self, session_id: &str, limit: u32, window_ms: i64) -> Result<bool>;

    /// Drop the session's rate counter
    async fn rate_clear(&self, session_id: &str) -> Result<()>;

    // --- fan-out ---

    /// Publish a frame to every node's delivery loop
    async fn publish(&self, frame: PeerFrame) -> Result<()>;

    /// Subscribe to the fan-out channel. Each node runs one delivery
    /// loop off this receiver.
    fn subscribe(&self) -> broadcast::Receiver<PeerFrame>;
}

// Shared reference to a state backend
pub type SharedBackend = Arc<dyn StateBackend>;

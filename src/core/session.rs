//! Session registry
//! Maps anonymous session ids to their live connection and room binding

use chrono::Utc;
use log::debug;

use crate::error::Result;
use crate::storage::{SessionRecord, SharedBackend};

/// Registry of anonymous participants, backed by the state backend
pub struct SessionRegistry {
    backend: SharedBackend,
}

impl SessionRegistry {
    pub fn new(backend: SharedBackend) -> Self {
        Self { backend }
    }

    /// Upsert a session under a (possibly new) connection. Resets the
    /// last-seen clock only; the creation timestamp and any room binding
    /// survive a repeated join.
    pub async fn add_session(&self, session_id: &str, connection_id: &str) -> Result<()> {
        let now = Utc::now();
        let (created_at, room_id) = match self.backend.get_session(session_id).await? {
            Some(existing) => (existing.created_at, existing.room_id),
            None => (now, None),
        };
        self.backend
            .put_session(SessionRecord {
                session_id: session_id.to_string(),
                connection_id: connection_id.to_string(),
                room_id,
                created_at,
                last_seen_at: now,
            })
            .await?;
        debug!("Session registered: {}", session_id);
        Ok(())
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        self.backend.get_session(session_id).await
    }

    /// Reset the inactivity clock
    pub async fn touch(&self, session_id: &str) -> Result<()> {
        self.backend.touch_session(session_id).await
    }

    pub async fn set_session_room(&self, session_id: &str, room_id: &str) -> Result<()> {
        self.backend.set_session_room(session_id, room_id).await
    }

    pub async fn clear_session_room(&self, session_id: &str) -> Result<()> {
        self.backend.clear_session_room(session_id).await
    }

    pub async fn remove_session(&self, session_id: &str) -> Result<()> {
        self.backend.remove_session(session_id).await?;
        debug!("Session removed: {}", session_id);
        Ok(())
    }

    pub async fn session_count(&self) -> Result<usize> {
        self.backend.session_count().await
    }

    /// Batch of sessions past the inactivity TTL, for the sweeper
    pub async fn expired_sessions(&self, ttl_secs: i64) -> Result<Vec<SessionRecord>> {
        self.backend.expired_sessions(ttl_secs).await
    }
}

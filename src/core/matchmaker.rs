//! Matchmaking queue and 2-party rooms
//!
//! The queue is strict FIFO with a set view for membership tests. Queue
//! entries can go stale (waiter disconnected, expired, or got paired by
//! an invite) so pairing re-validates every candidate against the
//! session registry before committing a room.

use log::{debug, info};
use uuid::Uuid;

use crate::constants::MATCH_POP_ATTEMPTS;
use crate::error::Result;
use crate::storage::{RoomMember, RoomRecord, SharedBackend};

pub struct Matchmaker {
    backend: SharedBackend,
}

impl Matchmaker {
    pub fn new(backend: SharedBackend) -> Self {
        Self { backend }
    }

    /// Try to pair the session with the oldest viable waiter. Falls back
    /// to enqueueing it and returns None. A session already waiting is
    /// left in place (no duplicate entries).
    pub async fn join_queue(
        &self,
        session_id: &str,
        connection_id: &str,
    ) -> Result<Option<RoomRecord>> {
        if self.backend.queue_contains(session_id).await? {
            return Ok(None);
        }

        for _ in 0..MATCH_POP_ATTEMPTS {
            let Some(candidate_id) = self.backend.queue_pop().await? else {
                break;
            };
            if candidate_id == session_id {
                continue;
            }
            // Validate against the registry: the waiter may have
            // disconnected or been paired since it enqueued.
            let Some(candidate) = self.backend.get_session(&candidate_id).await? else {
                debug!("Discarding stale queue entry: {}", candidate_id);
                continue;
            };
            if candidate.room_id.is_some() {
                debug!("Discarding queued session already in a room: {}", candidate_id);
                continue;
            }

            let waiter = RoomMember {
                session_id: candidate.session_id,
                connection_id: candidate.connection_id,
            };
            let joiner = RoomMember {
                session_id: session_id.to_string(),
                connection_id: connection_id.to_string(),
            };
            let room = self.pair(waiter, joiner).await?;
            return Ok(Some(room));
        }

        self.backend.queue_push(session_id).await?;
        Ok(None)
    }

    /// Remove a session from the queue. Safe when not enqueued.
    pub async fn leave_queue(&self, session_id: &str) -> Result<()> {
        self.backend.queue_remove(session_id).await
    }

    pub async fn is_in_queue(&self, session_id: &str) -> Result<bool> {
        self.backend.queue_contains(session_id).await
    }

    pub async fn queue_len(&self) -> Result<usize> {
        self.backend.queue_len().await
    }

    /// Mint a room for two members and install it atomically: record,
    /// room set, both reverse indices, both session bindings. Used by
    /// both the random and the invite pairing paths.
    pub async fn pair(&self, session1: RoomMember, session2: RoomMember) -> Result<RoomRecord> {
        let room = RoomRecord {
            room_id: Uuid::new_v4().to_string(),
            session1,
            session2,
        };
        self.backend.install_room(room.clone()).await?;
        info!("Room created: {}", room.room_id);
        Ok(room)
    }

    pub async fn get_room(&self, room_id: &str) -> Result<Option<RoomRecord>> {
        self.backend.get_room(room_id).await
    }

    pub async fn room_for_session(&self, session_id: &str) -> Result<Option<String>> {
        self.backend.room_for_session(session_id).await
    }

    /// Resolve the peer's current connection id. Prefers the registry's
    /// live connection; falls back to the one recorded at pairing time.
    /// None when the caller is not a member of the room.
    pub async fn peer_connection(
        &self,
        room_id: &str,
        session_id: &str,
    ) -> Result<Option<(String, String)>> {
        let Some(room) = self.backend.get_room(room_id).await? else {
            return Ok(None);
        };
        let Some(peer) = room.peer_of(session_id) else {
            return Ok(None);
        };
        let connection_id = match self.backend.get_session(&peer.session_id).await? {
            Some(record) => record.connection_id,
            None => peer.connection_id.clone(),
        };
        Ok(Some((peer.session_id.clone(), connection_id)))
    }

    /// Tear down a room. Idempotent.
    pub async fn destroy_room(&self, room_id: &str) -> Result<()> {
        self.backend.remove_room(room_id).await?;
        debug!("Room destroyed: {}", room_id);
        Ok(())
    }

    pub async fn room_count(&self) -> Result<usize> {
        self.backend.room_count().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryBackend, SessionRecord, StateBackend};
    use chrono::Utc;
    use std::sync::Arc;

    fn session(id: &str, conn: &str) -> SessionRecord {
        SessionRecord {
            session_id: id.to_string(),
            connection_id: conn.to_string(),
            room_id: None,
            created_at: Utc::now(),
            last_seen_at: Utc::now(),
        }
    }

    async fn registered(backend: &Arc<MemoryBackend>, id: &str, conn: &str) {
        backend.put_session(session(id, conn)).await.unwrap();
    }

    #[tokio::test]
    async fn test_fifo_pairing() {
        let backend = Arc::new(MemoryBackend::new());
        let matchmaker = Matchmaker::new(backend.clone());
        registered(&backend, "a", "c1").await;
        registered(&backend, "b", "c2").await;
        registered(&backend, "c", "c3").await;

        assert!(matchmaker.join_queue("a", "c1").await.unwrap().is_none());
        assert!(matchmaker.join_queue("b", "c2").await.unwrap().is_none());

        // The oldest waiter wins
        let room = matchmaker.join_queue("c", "c3").await.unwrap().unwrap();
        assert_eq!(room.session1.session_id, "a");
        assert_eq!(room.session2.session_id, "c");
        assert_eq!(matchmaker.queue_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_no_duplicate_queue_entries() {
        let backend = Arc::new(MemoryBackend::new());
        let matchmaker = Matchmaker::new(backend.clone());
        registered(&backend, "a", "c1").await;

        assert!(matchmaker.join_queue("a", "c1").await.unwrap().is_none());
        assert!(matchmaker.join_queue("a", "c1").await.unwrap().is_none());
        assert_eq!(matchmaker.queue_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stale_waiter_is_skipped() {
        let backend = Arc::new(MemoryBackend::new());
        let matchmaker = Matchmaker::new(backend.clone());
        registered(&backend, "gone", "c0").await;
        registered(&backend, "b", "c2").await;

        assert!(matchmaker.join_queue("gone", "c0").await.unwrap().is_none());
        backend.remove_session("gone").await.unwrap();

        // The stale entry is discarded and the joiner waits
        assert!(matchmaker.join_queue("b", "c2").await.unwrap().is_none());
        assert!(matchmaker.is_in_queue("b").await.unwrap());
        assert!(!matchmaker.is_in_queue("gone").await.unwrap());
    }

    #[tokio::test]
    async fn test_peer_connection_prefers_registry() {
        let backend = Arc::new(MemoryBackend::new());
        let matchmaker = Matchmaker::new(backend.clone());
        registered(&backend, "a", "c1").await;
        registered(&backend, "b", "c2").await;

        let room = matchmaker
            .pair(
                RoomMember {
                    session_id: "a".to_string(),
                    connection_id: "c1".to_string(),
                },
                RoomMember {
                    session_id: "b".to_string(),
                    connection_id: "c2".to_string(),
                },
            )
            .await
            .unwrap();

        // b reconnected under a new connection id
        registered(&backend, "b", "c2-new").await;
        backend.set_session_room("b", &room.room_id).await.unwrap();

        let (peer, conn) = matchmaker
            .peer_connection(&room.room_id, "a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(peer, "b");
        assert_eq!(conn, "c2-new");

        // Non-members resolve to nothing
        assert!(matchmaker
            .peer_connection(&room.room_id, "z")
            .await
            .unwrap()
            .is_none());
    }
}

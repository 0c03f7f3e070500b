//! Process-local state backend
//!
//! Keeps all coordination state in a single mutex-guarded struct, which
//! makes compound operations (room install, room teardown) atomic with
//! respect to each other. Suitable for single-node deployments and tests.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

use super::backend::{
    InviteRecord, PeerFrame, RateWindow, RoomRecord, SessionRecord, StateBackend,
};
use crate::error::Result;

const FANOUT_CAPACITY: usize = 256;

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<String, SessionRecord>,
    queue: VecDeque<String>,
    queue_members: HashSet<String>,
    // code -> (record, expiry epoch millis)
    invites: HashMap<String, (InviteRecord, i64)>,
    invite_by_session: HashMap<String, String>,
    rooms: HashMap<String, RoomRecord>,
    room_by_session: HashMap<String, String>,
    rates: HashMap<String, RateWindow>,
}

/// In-memory implementation of the state backend
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    fanout: broadcast::Sender<PeerFrame>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (fanout, _) = broadcast::channel(FANOUT_CAPACITY);
        Self {
            state: Mutex::new(MemoryState::default()),
            fanout,
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        Ok(self.state.lock()?)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryState {
    /// Drop an invite if its TTL has passed, returning whether a live
    /// invite remains under the code.
    fn prune_invite(&mut self, code: &str) -> bool {
        let expired_session = match self.invites.get(code) {
            Some((record, expires_at)) if Utc::now().timestamp_millis() >= *expires_at => {
                record.session_id.clone()
            }
            Some(_) => return true,
            None => return false,
        };
        self.invites.remove(code);
        self.invite_by_session.remove(&expired_session);
        false
    }
}

#[async_trait]
impl StateBackend for MemoryBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn put_session(&self, record: SessionRecord) -> Result<()> {
        self.state()?.sessions.insert(record.session_id.clone(), record);
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        Ok(self.state()?.sessions.get(session_id).cloned())
    }

    async fn touch_session(&self, session_id: &str) -> Result<()> {
        if let Some(record) = self.state()?.sessions.get_mut(session_id) {
            record.last_seen_at = Utc::now();
        }
        Ok(())
    }

    async fn set_session_room(&self, session_id: &str, room_id: &str) -> Result<()> {
        if let Some(record) = self.state()?.sessions.get_mut(session_id) {
            record.room_id = Some(room_id.to_string());
        }
        Ok(())
    }

    async fn clear_session_room(&self, session_id: &str) -> Result<()> {
        if let Some(record) = self.state()?.sessions.get_mut(session_id) {
            record.room_id = None;
        }
        Ok(())
    }

    async fn remove_session(&self, session_id: &str) -> Result<()> {
        self.state()?.sessions.remove(session_id);
        Ok(())
    }

    async fn session_count(&self) -> Result<usize> {
        Ok(self.state()?.sessions.len())
    }

    async fn expired_sessions(&self, ttl_secs: i64) -> Result<Vec<SessionRecord>> {
        let cutoff = Utc::now() - Duration::seconds(ttl_secs);
        let state = self.state()?;
        Ok(state
            .sessions
            .values()
            .filter(|record| record.last_seen_at < cutoff)
            .cloned()
            .collect())
    }

    async fn queue_push(&self, session_id: &str) -> Result<()> {
        let mut state = self.state()?;
        state.queue.push_back(session_id.to_string());
        state.queue_members.insert(session_id.to_string());
        Ok(())
    }

    async fn queue_pop(&self) -> Result<Option<String>> {
        let mut state = self.state()?;
        while let Some(session_id) = state.queue.pop_front() {
            // Entries cancelled out of the membership set are skipped
            if state.queue_members.remove(&session_id) {
                return Ok(Some(session_id));
            }
        }
        Ok(None)
    }

    async fn queue_remove(&self, session_id: &str) -> Result<()> {
        let mut state = self.state()?;
        state.queue.retain(|entry| entry != session_id);
        state.queue_members.remove(session_id);
        Ok(())
    }

    async fn queue_contains(&self, session_id: &str) -> Result<bool> {
        Ok(self.state()?.queue_members.contains(session_id))
    }

    async fn queue_len(&self) -> Result<usize> {
        Ok(self.state()?.queue_members.len())
    }

    async fn invite_insert(
        &self,
        code: &str,
        record: InviteRecord,
        ttl_secs: i64,
    ) -> Result<bool> {
        let mut state = self.state()?;
        if state.prune_invite(code) {
            return Ok(false);
        }
        let expires_at = Utc::now().timestamp_millis() + ttl_secs * 1000;
        state
            .invite_by_session
            .insert(record.session_id.clone(), code.to_string());
        state.invites.insert(code.to_string(), (record, expires_at));
        Ok(true)
    }

    async fn invite_take(&self, code: &str) -> Result<Option<InviteRecord>> {
        let mut state = self.state()?;
        if !state.prune_invite(code) {
            return Ok(None);
        }
        match state.invites.remove(code) {
            Some((record, _)) => {
                state.invite_by_session.remove(&record.session_id);
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn invite_code_for_session(&self, session_id: &str) -> Result<Option<String>> {
        let mut state = self.state()?;
        let Some(code) = state.invite_by_session.get(session_id).cloned() else {
            return Ok(None);
        };
        if state.prune_invite(&code) {
            Ok(Some(code))
        } else {
            Ok(None)
        }
    }

    async fn invite_remove_for_session(&self, session_id: &str) -> Result<bool> {
        let mut state = self.state()?;
        let Some(code) = state.invite_by_session.get(session_id).cloned() else {
            return Ok(false);
        };
        if !state.prune_invite(&code) {
            return Ok(false);
        }
        state.invites.remove(&code);
        state.invite_by_session.remove(session_id);
        Ok(true)
    }

    async fn install_room(&self, record: RoomRecord) -> Result<()> {
        let mut state = self.state()?;
        let room_id = record.room_id.clone();
        for member in [&record.session1, &record.session2] {
            state
                .room_by_session
                .insert(member.session_id.clone(), room_id.clone());
            if let Some(session) = state.sessions.get_mut(&member.session_id) {
                session.room_id = Some(room_id.clone());
            }
        }
        state.rooms.insert(room_id, record);
        Ok(())
    }

    async fn get_room(&self, room_id: &str) -> Result<Option<RoomRecord>> {
        Ok(self.state()?.rooms.get(room_id).cloned())
    }

    async fn room_for_session(&self, session_id: &str) -> Result<Option<String>> {
        Ok(self.state()?.room_by_session.get(session_id).cloned())
    }

    async fn remove_room(&self, room_id: &str) -> Result<()> {
        let mut state = self.state()?;
        let Some(record) = state.rooms.remove(room_id) else {
            return Ok(());
        };
        for member in [&record.session1, &record.session2] {
            state.room_by_session.remove(&member.session_id);
            if let Some(session) = state.sessions.get_mut(&member.session_id) {
                if session.room_id.as_deref() == Some(room_id) {
                    session.room_id = None;
                }
            }
        }
        Ok(())
    }

    async fn room_count(&self) -> Result<usize> {
        Ok(self.state()?.rooms.len())
    }

    async fn rate_hit(&self, session_id: &str, limit: u32, window_ms: i64) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let mut state = self.state()?;
        let fresh_window = match state.rates.get(session_id) {
            Some(window) if now - window.window_start <= window_ms => {
                if window.count >= limit {
                    return Ok(false);
                }
                false
            }
            _ => true,
        };
        if fresh_window {
            state.rates.insert(
                session_id.to_string(),
                RateWindow {
                    count: 1,
                    window_start: now,
                },
            );
        } else if let Some(window) = state.rates.get_mut(session_id) {
            window.count += 1;
        }
        Ok(true)
    }

    async fn rate_clear(&self, session_id: &str) -> Result<()> {
        self.state()?.rates.remove(session_id);
        Ok(())
    }

    async fn publish(&self, frame: PeerFrame) -> Result<()> {
        // No subscribers is fine; delivery is best-effort
        let _ = self.fanout.send(frame);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerFrame> {
        self.fanout.subscribe()
    }
}

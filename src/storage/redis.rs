//! Shared Redis state backend
//!
//! Key layout:
//!   session:{sessionId}        JSON session record
//!   sessions:index             zset of session ids scored by lastSeenAt
//!   queue:list                 FIFO list of session ids
//!   queue:set                  membership view of the queue
//!   invite:{code}              JSON invite record, TTL 5 min
//!   inviteBySession:{id}       code, TTL 5 min
//!   room:{roomId}              JSON room record
//!   rooms:set                  set of room ids
//!   roomBySession:{id}         roomId
//!   rate:{sessionId}           JSON {count, windowStart}
//!
//! Fan-out frames travel over the `relay:events` pub/sub channel; a
//! subscriber task bridges them into a node-local broadcast channel.

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use log::{error, warn};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::broadcast;

use super::backend::{
    InviteRecord, PeerFrame, RateWindow, RoomRecord, SessionRecord, StateBackend,
};
use crate::error::{RelayError, Result};

const EVENTS_CHANNEL: &str = "relay:events";
const FANOUT_CAPACITY: usize = 256;

fn session_key(session_id: &str) -> String {
    format!("session:{}", session_id)
}

fn invite_key(code: &str) -> String {
    format!("invite:{}", code)
}

fn invite_session_key(session_id: &str) -> String {
    format!("inviteBySession:{}", session_id)
}

fn room_key(room_id: &str) -> String {
    format!("room:{}", room_id)
}

fn room_session_key(session_id: &str) -> String {
    format!("roomBySession:{}", session_id)
}

fn rate_key(session_id: &str) -> String {
    format!("rate:{}", session_id)
}

fn backend_err(err: redis::RedisError) -> RelayError {
    RelayError::Backend(err.to_string())
}

fn codec_err(err: serde_json::Error) -> RelayError {
    RelayError::Backend(format!("corrupt backend record: {}", err))
}

/// State backend over a shared Redis deployment
pub struct RedisBackend {
    conn: ConnectionManager,
    fanout: broadcast::Sender<PeerFrame>,
}

impl RedisBackend {
    /// Connect and spawn the pub/sub subscriber task
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(backend_err)?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(backend_err)?;

        let (fanout, _) = broadcast::channel(FANOUT_CAPACITY);

        let mut pubsub = client.get_async_pubsub().await.map_err(backend_err)?;
        pubsub
            .subscribe(EVENTS_CHANNEL)
            .await
            .map_err(backend_err)?;

        let bridge = fanout.clone();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Discarding unreadable pub/sub payload: {}", e);
                        continue;
                    }
                };
                match serde_json::from_str::<PeerFrame>(&payload) {
                    Ok(frame) => {
                        let _ = bridge.send(frame);
                    }
                    Err(e) => warn!("Discarding malformed fan-out frame: {}", e),
                }
            }
            error!("Redis pub/sub stream ended; cross-node fan-out is down");
        });

        Ok(Self { conn, fanout })
    }
}

#[async_trait]
impl StateBackend for RedisBackend {
    fn kind(&self) -> &'static str {
        "redis"
    }

    async fn put_session(&self, record: SessionRecord) -> Result<()> {
        let mut conn = self.conn.clone();
        let value = serde_json::to_string(&record).map_err(codec_err)?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(session_key(&record.session_id), value)
            .zadd(
                "sessions:index",
                &record.session_id,
                record.last_seen_at.timestamp_millis(),
            );
        let _: () = pipe.query_async(&mut conn).await.map_err(backend_err)?;
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn
            .get(session_key(session_id))
            .await
            .map_err(backend_err)?;
        match value {
            Some(raw) => Ok(Some(serde_json::from_str(&raw).map_err(codec_err)?)),
            None => Ok(None),
        }
    }

    async fn touch_session(&self, session_id: &str) -> Result<()> {
        let Some(mut record) = self.get_session(session_id).await? else {
            return Ok(());
        };
        record.last_seen_at = Utc::now();
        self.put_session(record).await
    }

    async fn set_session_room(&self, session_id: &str, room_id: &str) -> Result<()> {
        let Some(mut record) = self.get_session(session_id).await? else {
            return Ok(());
        };
        record.room_id = Some(room_id.to_string());
        self.put_session(record).await
    }

    async fn clear_session_room(&self, session_id: &str) -> Result<()> {
        let Some(mut record) = self.get_session(session_id).await? else {
            return Ok(());
        };
        record.room_id = None;
        self.put_session(record).await
    }

    async fn remove_session(&self, session_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(session_key(session_id))
            .zrem("sessions:index", session_id);
        let _: () = pipe.query_async(&mut conn).await.map_err(backend_err)?;
        Ok(())
    }

    async fn session_count(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        conn.zcard("sessions:index").await.map_err(backend_err)
    }

    async fn expired_sessions(&self, ttl_secs: i64) -> Result<Vec<SessionRecord>> {
        let mut conn = self.conn.clone();
        let cutoff = Utc::now().timestamp_millis() - ttl_secs * 1000;
        let ids: Vec<String> = conn
            .zrangebyscore("sessions:index", 0, cutoff)
            .await
            .map_err(backend_err)?;

        let mut expired = Vec::with_capacity(ids.len());
        for session_id in ids {
            if let Some(record) = self.get_session(&session_id).await? {
                expired.push(record);
            } else {
                // Index entry with no record; drop the stragglers
                let _: i64 = conn
                    .zrem("sessions:index", &session_id)
                    .await
                    .map_err(backend_err)?;
            }
        }
        Ok(expired)
    }

    async fn queue_push(&self, session_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .lpush("queue:list", session_id)
            .sadd("queue:set", session_id);
        let _: () = pipe.query_async(&mut conn).await.map_err(backend_err)?;
        Ok(())
    }

    async fn queue_pop(&self) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        loop {
            let popped: Option<String> =
                conn.rpop("queue:list", None).await.map_err(backend_err)?;
            let Some(session_id) = popped else {
                return Ok(None);
            };
            // An entry cancelled after insertion is gone from the set;
            // skip it and keep draining.
            let live: i64 = conn
                .srem("queue:set", &session_id)
                .await
                .map_err(backend_err)?;
            if live > 0 {
                return Ok(Some(session_id));
            }
        }
    }

    async fn queue_remove(&self, session_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem("queue:list", 0, session_id)
            .srem("queue:set", session_id);
        let _: () = pipe.query_async(&mut conn).await.map_err(backend_err)?;
        Ok(())
    }

    async fn queue_contains(&self, session_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        conn.sismember("queue:set", session_id)
            .await
            .map_err(backend_err)
    }

    async fn queue_len(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        conn.scard("queue:set").await.map_err(backend_err)
    }

    async fn invite_insert(
        &self,
        code: &str,
        record: InviteRecord,
        ttl_secs: i64,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let value = serde_json::to_string(&record).map_err(codec_err)?;
        let claimed: Option<String> = redis::cmd("SET")
            .arg(invite_key(code))
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        if claimed.is_none() {
            return Ok(false);
        }
        conn.set_ex::<_, _, ()>(
            invite_session_key(&record.session_id),
            code,
            ttl_secs as u64,
        )
        .await
        .map_err(backend_err)?;
        Ok(true)
    }

    async fn invite_take(&self, code: &str) -> Result<Option<InviteRecord>> {
        let mut conn = self.conn.clone();
        // GETDEL makes redemption single-use even under racing redeemers
        let value: Option<String> = redis::cmd("GETDEL")
            .arg(invite_key(code))
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        let Some(raw) = value else {
            return Ok(None);
        };
        let record: InviteRecord = serde_json::from_str(&raw).map_err(codec_err)?;
        conn.del::<_, ()>(invite_session_key(&record.session_id))
            .await
            .map_err(backend_err)?;
        Ok(Some(record))
    }

    async fn invite_code_for_session(&self, session_id: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(invite_session_key(session_id))
            .await
            .map_err(backend_err)
    }

    async fn invite_remove_for_session(&self, session_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let code: Option<String> = conn
            .get(invite_session_key(session_id))
            .await
            .map_err(backend_err)?;
        let Some(code) = code else {
            return Ok(false);
        };
        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(invite_key(&code))
            .del(invite_session_key(session_id));
        let _: () = pipe.query_async(&mut conn).await.map_err(backend_err)?;
        Ok(true)
    }

    async fn install_room(&self, record: RoomRecord) -> Result<()> {
        let mut conn = self.conn.clone();
        let value = serde_json::to_string(&record).map_err(codec_err)?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(room_key(&record.room_id), value)
            .sadd("rooms:set", &record.room_id);
        for member in [&record.session1, &record.session2] {
            pipe.set(room_session_key(&member.session_id), &record.room_id);
            if let Some(mut session) = self.get_session(&member.session_id).await? {
                session.room_id = Some(record.room_id.clone());
                let raw = serde_json::to_string(&session).map_err(codec_err)?;
                pipe.set(session_key(&member.session_id), raw);
            }
        }
        let _: () = pipe.query_async(&mut conn).await.map_err(backend_err)?;
        Ok(())
    }

    async fn get_room(&self, room_id: &str) -> Result<Option<RoomRecord>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(room_key(room_id)).await.map_err(backend_err)?;
        match value {
            Some(raw) => Ok(Some(serde_json::from_str(&raw).map_err(codec_err)?)),
            None => Ok(None),
        }
    }

    async fn room_for_session(&self, session_id: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(room_session_key(session_id))
            .await
            .map_err(backend_err)
    }

    async fn remove_room(&self, room_id: &str) -> Result<()> {
        let Some(record) = self.get_room(room_id).await? else {
            return Ok(());
        };
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(room_key(room_id))
            .srem("rooms:set", room_id);
        for member in [&record.session1, &record.session2] {
            pipe.del(room_session_key(&member.session_id));
            if let Some(mut session) = self.get_session(&member.session_id).await? {
                if session.room_id.as_deref() == Some(room_id) {
                    session.room_id = None;
                    let raw = serde_json::to_string(&session).map_err(codec_err)?;
                    pipe.set(session_key(&member.session_id), raw);
                }
            }
        }
        let _: () = pipe.query_async(&mut conn).await.map_err(backend_err)?;
        Ok(())
    }

    async fn room_count(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        conn.scard("rooms:set").await.map_err(backend_err)
    }

    async fn rate_hit(&self, session_id: &str, limit: u32, window_ms: i64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let now = Utc::now().timestamp_millis();
        let value: Option<String> = conn.get(rate_key(session_id)).await.map_err(backend_err)?;

        let window = match value
            .as_deref()
            .and_then(|raw| serde_json::from_str::<RateWindow>(raw).ok())
        {
            Some(window) if now - window.window_start <= window_ms => {
                if window.count >= limit {
                    return Ok(false);
                }
                RateWindow {
                    count: window.count + 1,
                    window_start: window.window_start,
                }
            }
            _ => RateWindow {
                count: 1,
                window_start: now,
            },
        };

        let raw = serde_json::to_string(&window).map_err(codec_err)?;
        // Keyed to twice the window so abandoned counters self-expire
        conn.set_ex::<_, _, ()>(rate_key(session_id), raw, (window_ms as u64 / 1000) * 2)
            .await
            .map_err(backend_err)?;
        Ok(true)
    }

    async fn rate_clear(&self, session_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(rate_key(session_id))
            .await
            .map_err(backend_err)
    }

    async fn publish(&self, frame: PeerFrame) -> Result<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(&frame).map_err(codec_err)?;
        conn.publish::<_, _, ()>(EVENTS_CHANNEL, payload)
            .await
            .map_err(backend_err)
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerFrame> {
        self.fanout.subscribe()
    }
}

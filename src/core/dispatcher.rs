//! Event dispatcher
//!
//! Maps inbound client events to state operations and fan-out to the
//! peer. Each handler checks the session's holding state first: a
//! session is in at most one of {queue, invite, room} at any instant,
//! and a handler either rejects a conflicting transition or cancels the
//! current holding state before entering the new one.

use log::{debug, error};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::constants::MAX_DECODED_PAYLOAD_BYTES;
use crate::core::events::{
    base64_decoded_len, EncryptedPayload, InboundFrame, InvitePayload, JoinPayload, KeyPayload,
    ServerEvent,
};
use crate::core::server::SharedRelayManager;
use crate::error::{RelayError, Result};
use crate::storage::{RoomMember, SessionRecord};

/// Handles incoming client frames and routes them appropriately
pub struct EventDispatcher {
    server: SharedRelayManager,
}

impl EventDispatcher {
    pub fn new(server: SharedRelayManager) -> Self {
        Self { server }
    }

    /// Entry point for one inbound frame. Never tears the connection
    /// down; failures surface as `error` events to the sender.
    pub async fn handle_message(&self, connection_id: &str, text: &str) {
        let frame: InboundFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Malformed frame from {}: {}", connection_id, e);
                self.server.emit_error(connection_id, "Malformed frame").await;
                return;
            }
        };

        // Any inbound traffic counts as activity for the session TTL
        if let Some(session_id) = self.server.connections().session_of(connection_id).await {
            if let Err(e) = self.server.sessions().touch(&session_id).await {
                debug!("Failed to touch session {}: {}", session_id, e);
            }
        }

        let result = match frame.event.as_str() {
            "join" => self.on_join(connection_id, frame.data).await,
            "find-random" => self.on_find_random(connection_id).await,
            "cancel-search" => self.on_cancel_search(connection_id).await,
            "create-invite" => self.on_create_invite(connection_id).await,
            "join-invite" => self.on_join_invite(connection_id, frame.data).await,
            "key-exchange" => self.on_key_exchange(connection_id, frame.data).await,
            "send-encrypted" => self.on_send_encrypted(connection_id, frame.data).await,
            "security-alert" => self.on_security_alert(connection_id, frame.data).await,
            "chat-ready" => self.on_chat_ready(connection_id).await,
            "report" => self.on_report(connection_id).await,
            "leave-room" => self.on_leave_room(connection_id).await,
            other => {
                debug!("Unknown event from {}: {}", connection_id, other);
                Err(RelayError::InvalidInput("Unknown event".to_string()))
            }
        };

        if let Err(err) = result {
            if let RelayError::Backend(_) = &err {
                error!("Backend failure handling '{}': {}", frame.event, err);
            }
            self.server
                .emit_error(connection_id, &err.client_message())
                .await;
        }
    }

    /// The session bound to this connection, or a client-facing error
    async fn resolve_session(&self, connection_id: &str) -> Result<SessionRecord> {
        let session_id = self
            .server
            .connections()
            .session_of(connection_id)
            .await
            .ok_or_else(|| RelayError::NotFound("Session not found".to_string()))?;
        self.server
            .sessions()
            .get_session(&session_id)
            .await?
            .ok_or_else(|| RelayError::NotFound("Session not found".to_string()))
    }

    /// Like resolve_session, for events that are a no-op without one
    async fn current_session(&self, connection_id: &str) -> Result<Option<SessionRecord>> {
        match self.server.connections().session_of(connection_id).await {
            Some(session_id) => self.server.sessions().get_session(&session_id).await,
            None => Ok(None),
        }
    }

    fn require_room(record: &SessionRecord) -> Result<String> {
        record
            .room_id
            .clone()
            .ok_or_else(|| RelayError::Precondition("You are not in a chat".to_string()))
    }

    async fn on_join(&self, connection_id: &str, data: Value) -> Result<()> {
        let payload: JoinPayload = parse_payload(data, "session ID")?;
        if payload.session_id.is_empty() {
            return Err(RelayError::InvalidInput(
                "Session ID is required".to_string(),
            ));
        }
        self.server
            .register_session(connection_id, &payload.session_id)
            .await?;
        self.server.emit(connection_id, &ServerEvent::Joined).await;
        Ok(())
    }

    async fn on_find_random(&self, connection_id: &str) -> Result<()> {
        let record = self.resolve_session(connection_id).await?;
        if record.room_id.is_some() {
            return Err(RelayError::Precondition(
                "You are already in a chat".to_string(),
            ));
        }

        // An invite is a holding state; joining the queue cancels it
        self.server.invites().cancel(&record.session_id).await?;

        match self
            .server
            .matchmaker()
            .join_queue(&record.session_id, connection_id)
            .await?
        {
            Some(room) => {
                let matched = ServerEvent::Matched {
                    room_id: room.room_id.clone(),
                };
                self.server.emit(&room.session1.connection_id, &matched).await;
                self.server.emit(&room.session2.connection_id, &matched).await;
            }
            None => {
                self.server.emit(connection_id, &ServerEvent::Waiting).await;
            }
        }
        Ok(())
    }

    async fn on_cancel_search(&self, connection_id: &str) -> Result<()> {
        let Some(record) = self.current_session(connection_id).await? else {
            return Ok(());
        };
        self.server
            .matchmaker()
            .leave_queue(&record.session_id)
            .await?;
        // A match may have completed just before the cancel arrived;
        // leaving the room covers that race.
        self.server.leave_current_room(&record.session_id).await?;
        Ok(())
    }

    async fn on_create_invite(&self, connection_id: &str) -> Result<()> {
        let record = self.resolve_session(connection_id).await?;
        if record.room_id.is_some() {
            return Err(RelayError::Precondition(
                "You are already in a chat".to_string(),
            ));
        }
        if self
            .server
            .matchmaker()
            .is_in_queue(&record.session_id)
            .await?
        {
            return Err(RelayError::Precondition(
                "You are already searching for a chat".to_string(),
            ));
        }

        // Replace any invite the session still holds
        self.server.invites().cancel(&record.session_id).await?;
        let code = self
            .server
            .invites()
            .create(&record.session_id, connection_id)
            .await?;
        self.server
            .emit(connection_id, &ServerEvent::InviteCreated { code })
            .await;
        Ok(())
    }

    async fn on_join_invite(&self, connection_id: &str, data: Value) -> Result<()> {
        let payload: InvitePayload = parse_payload(data, "invite code")?;
        let redeemer = self.resolve_session(connection_id).await?;
        if redeemer.room_id.is_some() {
            return Err(RelayError::Precondition(
                "You are already in a chat".to_string(),
            ));
        }

        let invite = self
            .server
            .invites()
            .redeem(&payload.code)
            .await?
            .ok_or_else(not_found_invite)?;

        if invite.session_id == redeemer.session_id {
            return Err(RelayError::Precondition(
                "You can't join your own invite".to_string(),
            ));
        }
        let issuer = self
            .server
            .sessions()
            .get_session(&invite.session_id)
            .await?
            .ok_or_else(not_found_invite)?;
        if issuer.room_id.is_some() {
            return Err(RelayError::Precondition(
                "That person is already in a chat".to_string(),
            ));
        }

        // Queue membership is a holding state both parties give up
        self.server
            .matchmaker()
            .leave_queue(&redeemer.session_id)
            .await?;
        self.server
            .matchmaker()
            .leave_queue(&issuer.session_id)
            .await?;

        let room = self
            .server
            .matchmaker()
            .pair(
                RoomMember {
                    session_id: issuer.session_id,
                    connection_id: issuer.connection_id,
                },
                RoomMember {
                    session_id: redeemer.session_id,
                    connection_id: connection_id.to_string(),
                },
            )
            .await?;

        let matched = ServerEvent::Matched {
            room_id: room.room_id.clone(),
        };
        self.server.emit(&room.session1.connection_id, &matched).await;
        self.server.emit(&room.session2.connection_id, &matched).await;
        Ok(())
    }

    async fn on_key_exchange(&self, connection_id: &str, data: Value) -> Result<()> {
        let record = self.resolve_session(connection_id).await?;
        let room_id = Self::require_room(&record)?;
        let payload: KeyPayload = parse_payload(data, "public key")?;

        if let Some((_, peer_connection)) = self
            .server
            .matchmaker()
            .peer_connection(&room_id, &record.session_id)
            .await?
        {
            self.server
                .emit(
                    &peer_connection,
                    &ServerEvent::PeerKey {
                        public_key: payload.public_key,
                    },
                )
                .await;
        }
        Ok(())
    }

    async fn on_send_encrypted(&self, connection_id: &str, data: Value) -> Result<()> {
        let record = self.resolve_session(connection_id).await?;
        let room_id = Self::require_room(&record)?;
        let payload: EncryptedPayload = parse_payload(data, "encrypted payload")?;

        // The token is consumed even if the peer turns out to be gone;
        // refunding it would let a loner drain the window probe-free.
        if !self.server.budget().is_allowed(&record.session_id).await? {
            return Err(RelayError::RateLimited);
        }

        let decoded_len = base64_decoded_len(&payload.encrypted);
        if decoded_len > MAX_DECODED_PAYLOAD_BYTES {
            return Err(RelayError::Oversize(decoded_len));
        }

        if let Some((_, peer_connection)) = self
            .server
            .matchmaker()
            .peer_connection(&room_id, &record.session_id)
            .await?
        {
            self.server
                .emit(
                    &peer_connection,
                    &ServerEvent::ReceiveEncrypted {
                        encrypted: payload.encrypted,
                    },
                )
                .await;
        }
        Ok(())
    }

    async fn on_security_alert(&self, connection_id: &str, data: Value) -> Result<()> {
        let record = self.resolve_session(connection_id).await?;
        let room_id = Self::require_room(&record)?;

        if let Some((_, peer_connection)) = self
            .server
            .matchmaker()
            .peer_connection(&room_id, &record.session_id)
            .await?
        {
            // Relayed verbatim; the server does not interpret it
            self.server
                .emit(&peer_connection, &ServerEvent::PeerSecurityAlert(data))
                .await;
        }
        Ok(())
    }

    async fn on_chat_ready(&self, connection_id: &str) -> Result<()> {
        let record = self.resolve_session(connection_id).await?;
        let room_id = Self::require_room(&record)?;

        if let Some((_, peer_connection)) = self
            .server
            .matchmaker()
            .peer_connection(&room_id, &record.session_id)
            .await?
        {
            self.server.emit(&peer_connection, &ServerEvent::PeerReady).await;
        }
        Ok(())
    }

    async fn on_report(&self, connection_id: &str) -> Result<()> {
        let record = self.resolve_session(connection_id).await?;
        let room_id = Self::require_room(&record)?;

        let ended = ServerEvent::ChatEnded {
            reason: "Chat ended due to a report.".to_string(),
        };
        let peer = self
            .server
            .matchmaker()
            .peer_connection(&room_id, &record.session_id)
            .await?;

        self.server.emit(connection_id, &ended).await;
        if let Some((_, peer_connection)) = &peer {
            self.server.emit(peer_connection, &ended).await;
        }
        self.server.matchmaker().destroy_room(&room_id).await?;

        // A report terminates both sides: sessions are cascaded away
        // first so the force-closed sockets have nothing left to clean.
        self.server.cascade_cleanup(&record).await?;
        if let Some((peer_session, peer_connection)) = &peer {
            if let Some(peer_record) =
                self.server.sessions().get_session(peer_session).await?
            {
                self.server.cascade_cleanup(&peer_record).await?;
            }
            self.server.force_close(peer_connection).await;
        }
        self.server.force_close(connection_id).await;
        Ok(())
    }

    async fn on_leave_room(&self, connection_id: &str) -> Result<()> {
        let Some(record) = self.current_session(connection_id).await? else {
            return Ok(());
        };
        self.server.leave_current_room(&record.session_id).await?;
        Ok(())
    }
}

fn not_found_invite() -> RelayError {
    RelayError::NotFound("Invite code not found or expired".to_string())
}

fn parse_payload<T: DeserializeOwned>(data: Value, what: &str) -> Result<T> {
    serde_json::from_value(data)
        .map_err(|_| RelayError::InvalidInput(format!("Invalid or missing {}", what)))
}

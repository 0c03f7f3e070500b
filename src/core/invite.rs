//! One-time invite codes
//!
//! Codes are `TALK-` plus four uppercase hex characters. 16 bits of
//! entropy is enough for a 5-minute TTL; collisions are resolved by
//! retrying against the backend's if-absent insert.

use chrono::Utc;
use log::debug;
use rand::Rng;

use crate::constants::{INVITE_MINT_ATTEMPTS, INVITE_PREFIX, INVITE_TTL_SECS};
use crate::error::{RelayError, Result};
use crate::storage::{InviteRecord, SharedBackend};

pub struct InviteIssuer {
    backend: SharedBackend,
}

impl InviteIssuer {
    pub fn new(backend: SharedBackend) -> Self {
        Self { backend }
    }

    /// Mint a fresh invite for the session. The caller has already
    /// cancelled any invite the session held.
    pub async fn create(&self, session_id: &str, connection_id: &str) -> Result<String> {
        for _ in 0..INVITE_MINT_ATTEMPTS {
            let code = mint_code();
            let record = InviteRecord {
                session_id: session_id.to_string(),
                connection_id: connection_id.to_string(),
                created_at: Utc::now(),
            };
            if self
                .backend
                .invite_insert(&code, record, INVITE_TTL_SECS)
                .await?
            {
                debug!("Invite created for session {}", session_id);
                return Ok(code);
            }
        }
        Err(RelayError::AllocationExhausted)
    }

    /// Redeem a code: normalises, then reads and deletes both keys.
    /// Missing and expired codes are indistinguishable to the caller.
    pub async fn redeem(&self, code: &str) -> Result<Option<InviteRecord>> {
        let code = normalize_code(code);
        self.backend.invite_take(&code).await
    }

    /// Cancel the session's active invite, if any
    pub async fn cancel(&self, session_id: &str) -> Result<bool> {
        let cancelled = self.backend.invite_remove_for_session(session_id).await?;
        if cancelled {
            debug!("Invite cancelled for session {}", session_id);
        }
        Ok(cancelled)
    }

    pub async fn has_invite(&self, session_id: &str) -> Result<bool> {
        Ok(self
            .backend
            .invite_code_for_session(session_id)
            .await?
            .is_some())
    }
}

/// Codes are matched case-insensitively and tolerate copy-paste whitespace
fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

fn mint_code() -> String {
    let suffix: u16 = rand::thread_rng().gen();
    format!("{}{:04X}", INVITE_PREFIX, suffix)
}

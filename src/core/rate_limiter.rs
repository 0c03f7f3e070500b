//! Per-session message budget
//!
//! Fixed-window counter over the state backend: 30 messages per 60
//! seconds. A courtesy limit against flooding, not a security boundary.

use crate::constants::{RATE_LIMIT_PER_WINDOW, RATE_WINDOW_MS};
use crate::error::Result;
use crate::storage::SharedBackend;

pub struct MessageBudget {
    backend: SharedBackend,
    limit: u32,
    window_ms: i64,
}

impl MessageBudget {
    pub fn new(backend: SharedBackend) -> Self {
        Self {
            backend,
            limit: RATE_LIMIT_PER_WINDOW,
            window_ms: RATE_WINDOW_MS,
        }
    }

    /// Check and consume one message from the session's window
    pub async fn is_allowed(&self, session_id: &str) -> Result<bool> {
        self.backend
            .rate_hit(session_id, self.limit, self.window_ms)
            .await
    }

    /// Drop the counter entirely (on disconnect)
    pub async fn clear(&self, session_id: &str) -> Result<()> {
        self.backend.rate_clear(session_id).await
    }
}

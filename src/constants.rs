// Fundamental configuration constants
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3000;
pub const WS_PATH: &str = "ws";

// Session lifecycle
pub const SESSION_TTL_SECS: i64 = 30 * 60;
pub const SWEEP_INTERVAL_SECS: u64 = 30;

// Invite codes
pub const INVITE_PREFIX: &str = "TALK-";
pub const INVITE_TTL_SECS: i64 = 5 * 60;
pub const INVITE_MINT_ATTEMPTS: u32 = 10;

// Matchmaking
pub const MATCH_POP_ATTEMPTS: usize = 5;

// Rate limiting (courtesy limit, not a security boundary)
pub const RATE_WINDOW_MS: i64 = 60_000;
pub const RATE_LIMIT_PER_WINDOW: u32 = 30;

// Payload caps. The frame cap is lower than the decoded-payload cap
// because encrypted payloads arrive base64-encoded inside JSON framing.
pub const MAX_DECODED_PAYLOAD_BYTES: usize = 35 * 1024 * 1024;
pub const MAX_FRAME_BYTES: usize = 30 * 1024 * 1024;

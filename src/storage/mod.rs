//! Pluggable state backends for the coordination plane

pub mod backend;
pub mod memory;
pub mod redis;

// Re-export the backend surface
pub use backend::{
    InviteRecord, PeerFrame, RateWindow, RoomMember, RoomRecord, SessionRecord, SharedBackend,
    StateBackend,
};
pub use memory::MemoryBackend;
pub use redis::RedisBackend;

//! Request handlers for the server endpoints

pub mod health;
pub mod websocket;

// Re-export the websocket handler
pub use websocket::handle_ws_client;

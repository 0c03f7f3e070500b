//! Shared helpers for driving the relay through fake connections

#![allow(dead_code)]

use std::sync::Arc;
use tokio::sync::mpsc;
use warp::ws::Message as WsMessage;

use hush_relay::core::{EventDispatcher, RelayManager, SharedRelayManager};
use hush_relay::storage::MemoryBackend;

/// A fake client: an attached connection plus the receiving half of its
/// outbound channel.
pub struct TestClient {
    pub connection_id: String,
    rx: mpsc::UnboundedReceiver<WsMessage>,
}

impl TestClient {
    /// Next frame delivered to this client, parsed. Close frames come
    /// back as `{"event": "__closed"}`.
    pub fn next_event(&mut self) -> Option<serde_json::Value> {
        match self.rx.try_recv() {
            Ok(msg) if msg.is_close() => Some(serde_json::json!({"event": "__closed"})),
            Ok(msg) => msg
                .to_str()
                .ok()
                .and_then(|text| serde_json::from_str(text).ok()),
            Err(_) => None,
        }
    }

    /// Name of the next delivered event, if any
    pub fn next_event_name(&mut self) -> Option<String> {
        self.next_event()
            .and_then(|frame| frame["event"].as_str().map(str::to_string))
    }

    pub fn drain(&mut self) {
        while self.rx.try_recv().is_ok() {}
    }
}

pub fn relay() -> (SharedRelayManager, EventDispatcher) {
    let server: SharedRelayManager =
        Arc::new(RelayManager::new(Arc::new(MemoryBackend::new())));
    let dispatcher = EventDispatcher::new(server.clone());
    (server, dispatcher)
}

pub async fn connect(server: &SharedRelayManager, connection_id: &str) -> TestClient {
    let (tx, rx) = mpsc::unbounded_channel();
    server.attach_connection(connection_id, tx).await;
    TestClient {
        connection_id: connection_id.to_string(),
        rx,
    }
}

pub async fn send(dispatcher: &EventDispatcher, client: &TestClient, frame: serde_json::Value) {
    dispatcher
        .handle_message(&client.connection_id, &frame.to_string())
        .await;
}

/// Join a session and discard the ack
pub async fn join(dispatcher: &EventDispatcher, client: &mut TestClient, session_id: &str) {
    send(
        dispatcher,
        client,
        serde_json::json!({"event": "join", "data": {"sessionId": session_id}}),
    )
    .await;
    assert_eq!(client.next_event_name().as_deref(), Some("joined"));
}

/// Pair two joined clients through the random queue, returning the room id
pub async fn pair_random(
    dispatcher: &EventDispatcher,
    first: &mut TestClient,
    second: &mut TestClient,
) -> String {
    send(dispatcher, first, serde_json::json!({"event": "find-random"})).await;
    assert_eq!(first.next_event_name().as_deref(), Some("waiting"));

    send(dispatcher, second, serde_json::json!({"event": "find-random"})).await;
    let matched = second.next_event().expect("second client should match");
    assert_eq!(matched["event"], "matched");
    let room_id = matched["data"]["roomId"].as_str().unwrap().to_string();

    let matched = first.next_event().expect("first client should match");
    assert_eq!(matched["event"], "matched");
    assert_eq!(matched["data"]["roomId"].as_str().unwrap(), room_id);

    room_id
}

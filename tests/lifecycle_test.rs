mod common;

use common::{connect, join, pair_random, relay, send};
use serde_json::json;

#[tokio::test]
async fn test_disconnect_mid_chat_notifies_peer_and_tears_down() {
    let (server, dispatcher) = relay();
    let mut alice = connect(&server, "conn-a").await;
    let mut bob = connect(&server, "conn-b").await;
    join(&dispatcher, &mut alice, "alice").await;
    join(&dispatcher, &mut bob, "bob").await;
    pair_random(&dispatcher, &mut alice, &mut bob).await;

    server.disconnect("conn-a").await.unwrap();

    let ended = bob.next_event().unwrap();
    assert_eq!(ended["event"], "chat-ended");
    assert_eq!(ended["data"]["reason"], "The other person has left.");

    let stats = server.stats().await.unwrap();
    assert_eq!(stats.active_rooms, 0);
    assert_eq!(stats.active_sessions, 1);
    assert!(server
        .matchmaker()
        .room_for_session("bob")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_double_disconnect_causes_no_double_cleanup() {
    let (server, dispatcher) = relay();
    let mut alice = connect(&server, "conn-a").await;
    let mut bob = connect(&server, "conn-b").await;
    join(&dispatcher, &mut alice, "alice").await;
    join(&dispatcher, &mut bob, "bob").await;
    pair_random(&dispatcher, &mut alice, &mut bob).await;

    server.disconnect("conn-a").await.unwrap();
    server.disconnect("conn-a").await.unwrap();

    // Exactly one notification reached the peer
    assert_eq!(bob.next_event_name().as_deref(), Some("chat-ended"));
    assert!(bob.next_event().is_none());
}

#[tokio::test]
async fn test_disconnect_cascades_queue_and_invite_state() {
    let (server, dispatcher) = relay();
    let mut alice = connect(&server, "conn-a").await;
    join(&dispatcher, &mut alice, "alice").await;

    send(&dispatcher, &alice, json!({"event": "create-invite"})).await;
    let code = alice.next_event().unwrap()["data"]["code"]
        .as_str()
        .unwrap()
        .to_string();

    server.disconnect("conn-a").await.unwrap();
    assert_eq!(server.stats().await.unwrap().active_sessions, 0);

    // The orphaned invite died with its issuer
    let mut bob = connect(&server, "conn-b").await;
    join(&dispatcher, &mut bob, "bob").await;
    send(
        &dispatcher,
        &bob,
        json!({"event": "join-invite", "data": {"code": code}}),
    )
    .await;
    let err = bob.next_event().unwrap();
    assert_eq!(err["event"], "error");
    assert_eq!(err["data"]["message"], "Invite code not found or expired");
}

#[tokio::test]
async fn test_duplicate_join_takes_over_the_session() {
    let (server, dispatcher) = relay();
    let mut old = connect(&server, "conn-1").await;
    join(&dispatcher, &mut old, "alice").await;

    let mut new = connect(&server, "conn-2").await;
    join(&dispatcher, &mut new, "alice").await;

    // The old connection got a close frame and nothing else
    assert_eq!(old.next_event_name().as_deref(), Some("__closed"));
    assert!(old.next_event().is_none());

    // One session, bound to the new connection
    assert_eq!(server.stats().await.unwrap().active_sessions, 1);
    let record = server.sessions().get_session("alice").await.unwrap().unwrap();
    assert_eq!(record.connection_id, "conn-2");

    // The superseded socket's own disconnect cleans nothing up
    server.disconnect("conn-1").await.unwrap();
    assert_eq!(server.stats().await.unwrap().active_sessions, 1);
}

#[tokio::test]
async fn test_repeat_join_on_same_connection_keeps_the_room() {
    let (server, dispatcher) = relay();
    let mut alice = connect(&server, "conn-a").await;
    let mut bob = connect(&server, "conn-b").await;
    join(&dispatcher, &mut alice, "alice").await;
    join(&dispatcher, &mut bob, "bob").await;
    let room_id = pair_random(&dispatcher, &mut alice, &mut bob).await;

    // A client-side retry of the join must not detach alice from the
    // room she is in
    join(&dispatcher, &mut alice, "alice").await;
    assert!(bob.next_event().is_none());

    let record = server.sessions().get_session("alice").await.unwrap().unwrap();
    assert_eq!(record.room_id.as_deref(), Some(room_id.as_str()));
    assert_eq!(
        server.matchmaker().room_for_session("alice").await.unwrap(),
        Some(room_id.clone())
    );
    assert_eq!(server.stats().await.unwrap().active_rooms, 1);

    // She is still paired, so searching again is rejected
    send(&dispatcher, &alice, json!({"event": "find-random"})).await;
    let err = alice.next_event().unwrap();
    assert_eq!(err["event"], "error");
    assert_eq!(err["data"]["message"], "You are already in a chat");
}

#[tokio::test]
async fn test_takeover_mid_chat_ends_the_old_room_once() {
    let (server, dispatcher) = relay();
    let mut alice = connect(&server, "conn-a").await;
    let mut bob = connect(&server, "conn-b").await;
    join(&dispatcher, &mut alice, "alice").await;
    join(&dispatcher, &mut bob, "bob").await;
    pair_random(&dispatcher, &mut alice, &mut bob).await;

    let mut rejoined = connect(&server, "conn-a2").await;
    join(&dispatcher, &mut rejoined, "alice").await;

    // Bob hears the chat end exactly once, even after the old socket
    // runs its disconnect handler
    assert_eq!(bob.next_event_name().as_deref(), Some("chat-ended"));
    server.disconnect("conn-a").await.unwrap();
    assert!(bob.next_event().is_none());

    let stats = server.stats().await.unwrap();
    assert_eq!(stats.active_rooms, 0);
    assert_eq!(stats.active_sessions, 2);
}

#[tokio::test]
async fn test_expiry_sweep_runs_the_same_cascade() {
    let (server, dispatcher) = relay();
    let mut alice = connect(&server, "conn-a").await;
    let mut bob = connect(&server, "conn-b").await;
    join(&dispatcher, &mut alice, "alice").await;
    join(&dispatcher, &mut bob, "bob").await;
    pair_random(&dispatcher, &mut alice, &mut bob).await;

    // A negative TTL makes every session stale
    let expired = server.expire_stale_sessions(-1).await.unwrap();
    assert_eq!(expired, 2);

    let stats = server.stats().await.unwrap();
    assert_eq!(stats.active_sessions, 0);
    assert_eq!(stats.active_rooms, 0);
    assert_eq!(stats.waiting_in_queue, 0);

    // A second sweep finds nothing
    assert_eq!(server.expire_stale_sessions(-1).await.unwrap(), 0);
}

#[tokio::test]
async fn test_fresh_sessions_survive_a_sweep() {
    let (server, dispatcher) = relay();
    let mut alice = connect(&server, "conn-a").await;
    join(&dispatcher, &mut alice, "alice").await;

    let expired = server
        .expire_stale_sessions(hush_relay::constants::SESSION_TTL_SECS)
        .await
        .unwrap();
    assert_eq!(expired, 0);
    assert_eq!(server.stats().await.unwrap().active_sessions, 1);
}

#[tokio::test]
async fn test_report_ends_both_sides() {
    let (server, dispatcher) = relay();
    let mut alice = connect(&server, "conn-a").await;
    let mut bob = connect(&server, "conn-b").await;
    join(&dispatcher, &mut alice, "alice").await;
    join(&dispatcher, &mut bob, "bob").await;
    pair_random(&dispatcher, &mut alice, &mut bob).await;

    send(&dispatcher, &alice, json!({"event": "report"})).await;

    let ended = alice.next_event().unwrap();
    assert_eq!(ended["event"], "chat-ended");
    assert_eq!(ended["data"]["reason"], "Chat ended due to a report.");
    assert_eq!(alice.next_event_name().as_deref(), Some("__closed"));

    let ended = bob.next_event().unwrap();
    assert_eq!(ended["event"], "chat-ended");
    assert_eq!(ended["data"]["reason"], "Chat ended due to a report.");
    assert_eq!(bob.next_event_name().as_deref(), Some("__closed"));

    let stats = server.stats().await.unwrap();
    assert_eq!(stats.active_rooms, 0);
    assert_eq!(stats.active_sessions, 0);
}

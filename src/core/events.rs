//! Wire events for the relay protocol
//!
//! Frames are JSON objects shaped `{"event": <name>, "data": {...}}`.
//! Inbound frames are parsed in two steps (envelope, then per-event
//! payload) so unlisted fields are ignored rather than rejected.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope of an inbound client frame
#[derive(Debug, Deserialize)]
pub struct InboundFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// Payload of `join`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    pub session_id: String,
}

/// Payload of `join-invite`
#[derive(Debug, Deserialize)]
pub struct InvitePayload {
    pub code: String,
}

/// Payload of `key-exchange`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPayload {
    pub public_key: String,
}

/// Payload of `send-encrypted`
#[derive(Debug, Deserialize)]
pub struct EncryptedPayload {
    pub encrypted: String,
}

/// Server-to-client events
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    Joined,
    Waiting,
    #[serde(rename_all = "camelCase")]
    Matched { room_id: String },
    InviteCreated { code: String },
    #[serde(rename_all = "camelCase")]
    PeerKey { public_key: String },
    ReceiveEncrypted { encrypted: String },
    PeerSecurityAlert(Value),
    PeerReady,
    ChatEnded { reason: String },
    Error { message: String },
}

/// Estimated decoded length of a base64 string, without decoding it
pub fn base64_decoded_len(encoded: &str) -> usize {
    let padding = if encoded.ends_with("==") {
        2
    } else if encoded.ends_with('=') {
        1
    } else {
        0
    };
    (encoded.len() * 3 / 4).saturating_sub(padding)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_decoded_len() {
        assert_eq!(base64_decoded_len(""), 0);
        assert_eq!(base64_decoded_len("TWFu"), 3);
        assert_eq!(base64_decoded_len("TWE="), 2);
        assert_eq!(base64_decoded_len("TQ=="), 1);
    }

    #[test]
    fn test_inbound_frame_tolerates_missing_data() {
        let frame: InboundFrame = serde_json::from_str(r#"{"event":"find-random"}"#).unwrap();
        assert_eq!(frame.event, "find-random");
        assert!(frame.data.is_null());
    }

    #[test]
    fn test_inbound_payload_ignores_unlisted_fields() {
        let frame: InboundFrame =
            serde_json::from_str(r#"{"event":"join","data":{"sessionId":"abc","junk":1}}"#)
                .unwrap();
        let payload: JoinPayload = serde_json::from_value(frame.data).unwrap();
        assert_eq!(payload.session_id, "abc");
    }

    #[test]
    fn test_server_event_wire_shape() {
        let event = ServerEvent::Matched {
            room_id: "r-1".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "matched");
        assert_eq!(json["data"]["roomId"], "r-1");

        let event = ServerEvent::ChatEnded {
            reason: "The other person has left.".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "chat-ended");
        assert_eq!(json["data"]["reason"], "The other person has left.");
    }

    #[test]
    fn test_security_alert_relays_verbatim() {
        let body = serde_json::json!({"level": "warn", "detail": {"x": 1}});
        let event = ServerEvent::PeerSecurityAlert(body.clone());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "peer-security-alert");
        assert_eq!(json["data"], body);
    }
}

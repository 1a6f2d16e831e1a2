//! JSON wire protocol spoken over the WebSocket transport.
//!
//! Client frames are `{"event": <name>, "data": {...}, "seq": n}`. A frame
//! carrying a `seq` receives an `ack` frame with the same `seq` and either
//! the operation result or an error message; frames without `seq` are
//! fire-and-forget. Server-initiated events use the same envelope without
//! `seq`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{CallId, CallStatus, MessageId, MessageKind, Role, UserId};

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

/// Envelope around a client event, carrying the optional acknowledgment
/// sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(flatten)]
    pub event: ClientEvent,
}

/// Every event a client may issue over the socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    /// Explicit re-registration after a failed or torn-down room join.
    RejoinRooms,
    /// Fetch the roster (message-able counterparts with annotations).
    GetUsers,
    ToggleFavorite {
        target_id: UserId,
    },
    SendMessage(SendMessagePayload),
    /// Fetch the full conversation with a counterpart; marks their
    /// messages to the requester as read.
    GetMessages {
        counterpart_id: UserId,
    },
    ClearChats {
        counterpart_id: UserId,
    },
    GetUserProfile {
        user_id: UserId,
    },
    GetCallLogs {
        counterpart_id: UserId,
    },
    CallUser {
        to: UserId,
        offer: String,
        #[serde(default)]
        caller_name: Option<String>,
    },
    AnswerCall {
        to: UserId,
        answer: String,
        call_id: CallId,
    },
    IceCandidate {
        to: UserId,
        candidate: String,
        #[serde(default)]
        call_id: Option<CallId>,
    },
    RejectCall {
        to: UserId,
        call_id: CallId,
    },
    EndCall {
        to: UserId,
        call_id: CallId,
    },
}

/// Body of a `sendMessage` event. `content` is either plain text or an
/// inline-encoded blob (`data:` URL) that the server resolves to a durable
/// attachment URL before persisting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub receiver_id: UserId,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<i64>,
    #[serde(default)]
    pub file_type: Option<String>,
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

/// Every event the server emits, room-scoped unless noted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// A new message for a conversation the receiving user is part of.
    ReceiveMessage { message: WireMessage },
    /// Lightweight conversation-changed signal; clients refetch on receipt.
    UpdateMessages { counterpart_id: UserId },
    /// A previously sent message was read by its recipient.
    UpdateMessageStatus { message_id: MessageId, read: bool },
    /// Fresh roster push (unread counts, last-message previews, flags).
    UpdateUsers { users: Vec<RosterEntry> },
    /// Full set of currently-online user ids, sent to every connection.
    OnlineStatus { online: Vec<UserId> },
    IncomingCall {
        call_id: CallId,
        from: UserId,
        #[serde(default)]
        caller_name: Option<String>,
        offer: String,
    },
    /// Confirmation to the answerer that the answer was relayed.
    CallAnswered { call_id: CallId },
    /// Answer payload relayed to the caller.
    CallAccepted { call_id: CallId, answer: String },
    CallRejected { call_id: CallId },
    CallEnded { call_id: CallId, duration_secs: i64 },
    IceCandidate {
        #[serde(default)]
        call_id: Option<CallId>,
        from: UserId,
        candidate: String,
    },
    /// Room re-join failed after retries; the client should issue an
    /// explicit `rejoinRooms`.
    RejoinFailed { reason: String },
    /// Acknowledgment of a client frame that carried a `seq`.
    Ack(AckPayload),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    pub seq: u64,
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub body: Value,
}

impl AckPayload {
    pub fn success(seq: u64, body: Value) -> Self {
        Self {
            seq,
            status: AckStatus::Success,
            message: None,
            body,
        }
    }

    pub fn error(seq: u64, message: impl Into<String>) -> Self {
        Self {
            seq,
            status: AckStatus::Error,
            message: Some(message.into()),
            body: Value::Null,
        }
    }
}

// ---------------------------------------------------------------------------
// Wire views of persisted records
// ---------------------------------------------------------------------------

/// A chat message as delivered to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub read: bool,
}

/// A call record as delivered to clients (call history).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireCall {
    pub id: CallId,
    pub caller_id: UserId,
    pub receiver_id: UserId,
    pub status: CallStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: i64,
}

/// One roster row: a message-able counterpart with its annotations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub user_id: UserId,
    pub display_name: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_image_url: Option<String>,
    pub unread_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    pub favorite: bool,
    pub online: bool,
}

/// Public profile view returned by `getUserProfile`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub user_id: UserId,
    pub display_name: String,
    pub email: String,
    pub role: Role,
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_image_url: Option<String>,
    pub online: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frame_round_trip() {
        let frame = ClientFrame {
            seq: Some(7),
            event: ClientEvent::SendMessage(SendMessagePayload {
                receiver_id: UserId::new(),
                content: "hello".into(),
                kind: MessageKind::Text,
                file_name: None,
                file_size: None,
                file_type: None,
            }),
        };

        let json = serde_json::to_string(&frame).unwrap();
        let back: ClientFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back.seq, Some(7));
        assert!(matches!(back.event, ClientEvent::SendMessage(_)));
    }

    #[test]
    fn unit_event_parses_without_data() {
        let frame: ClientFrame = serde_json::from_str(r#"{"event":"rejoinRooms"}"#).unwrap();
        assert!(frame.seq.is_none());
        assert!(matches!(frame.event, ClientEvent::RejoinRooms));
    }

    #[test]
    fn event_names_are_camel_case() {
        let id = UserId::new();
        let frame = ClientFrame {
            seq: None,
            event: ClientEvent::GetMessages { counterpart_id: id },
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""event":"getMessages""#));
        assert!(json.contains(r#""counterpartId""#));
    }

    #[test]
    fn ack_error_carries_message() {
        let ack = AckPayload::error(3, "receiver offline");
        let json = serde_json::to_value(ServerEvent::Ack(ack)).unwrap();
        assert_eq!(json["event"], "ack");
        assert_eq!(json["data"]["status"], "error");
        assert_eq!(json["data"]["message"], "receiver offline");
    }

    #[test]
    fn send_message_accepts_type_field() {
        let raw = r#"{
            "event": "sendMessage",
            "seq": 1,
            "data": {
                "receiverId": "7e2f8f4e-83a8-4ab1-9c2e-52a3d2f1a111",
                "content": "data:image/png;base64,aGk=",
                "type": "image",
                "fileName": "hi.png"
            }
        }"#;
        let frame: ClientFrame = serde_json::from_str(raw).unwrap();
        match frame.event {
            ClientEvent::SendMessage(payload) => {
                assert_eq!(payload.kind, MessageKind::Image);
                assert_eq!(payload.file_name.as_deref(), Some("hi.png"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

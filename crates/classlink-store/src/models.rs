//! Domain model structs persisted in the SQLite database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to the wire layer after the server strips private fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use classlink_shared::types::{CallId, CallStatus, MessageId, MessageKind, Role, UserId};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A platform account, read-mostly from this crate's point of view: the
/// account system creates it, the real-time core only flips `is_online`
/// and the favorites set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    pub email: String,
    pub role: Role,
    /// Only verified users appear in rosters and may receive messages.
    pub verified: bool,
    pub profile_image_url: Option<String>,
    /// Durable presence flag.  Survives restarts and is therefore stale
    /// until reconciled against live connections.
    pub is_online: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single chat message.  Immutable once persisted except for `read`,
/// which transitions `false -> true` exactly once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    /// Plain text, or the durable attachment URL for non-text kinds.
    pub content: String,
    pub kind: MessageKind,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    pub file_type: Option<String>,
    /// Server-assigned; defines per-conversation ordering.
    pub created_at: DateTime<Utc>,
    pub read: bool,
}

// ---------------------------------------------------------------------------
// Call
// ---------------------------------------------------------------------------

/// A call attempt.  Created on initiation and mutated only through the
/// compare-and-set transitions in [`calls`](crate::calls); never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Call {
    pub id: CallId,
    pub caller_id: UserId,
    pub receiver_id: UserId,
    /// Opaque SDP blob from the caller.
    pub offer: String,
    pub status: CallStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the call is accepted.
    pub started_at: Option<DateTime<Utc>>,
    /// Set at any terminal transition.
    pub ended_at: Option<DateTime<Utc>>,
    /// `ended_at - started_at` in whole seconds; 0 for calls that never
    /// reached `accepted`.
    pub duration_secs: i64,
}

// ---------------------------------------------------------------------------
// AuthToken
// ---------------------------------------------------------------------------

/// A bearer credential mapping to a user.  Issued by the external identity
/// system; this crate only reads it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthToken {
    pub token: String,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
}

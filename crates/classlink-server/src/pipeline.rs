//! Message pipeline: validate, classify, persist, fan out.
//!
//! Delivery is push-based; a message becomes visible to both parties'
//! rooms the moment it is persisted, and the per-conversation order is
//! the server-assigned creation timestamp.  Offline receivers get the
//! message replayed when their next connection registers.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use classlink_shared::error::Result;
use classlink_shared::protocol::{
    SendMessagePayload, ServerEvent, UserProfile, WireMessage,
};
use classlink_shared::types::{MessageId, MessageKind, Role, UserId};
use classlink_shared::SignalError;

use classlink_store::{Message, StoreError, User};

use crate::api::SharedStore;
use crate::attachments::{decode_inline, AttachmentStore};
use crate::config::ServerConfig;
use crate::roster::RosterService;
use crate::topic::Topics;

pub struct MessagePipeline {
    store: SharedStore,
    topics: Topics,
    attachments: Arc<AttachmentStore>,
    roster: RosterService,
    config: Arc<ServerConfig>,
}

impl MessagePipeline {
    pub fn new(
        store: SharedStore,
        topics: Topics,
        attachments: Arc<AttachmentStore>,
        roster: RosterService,
        config: Arc<ServerConfig>,
    ) -> Self {
        Self {
            store,
            topics,
            attachments,
            roster,
            config,
        }
    }

    /// Validate, classify, persist and deliver one message.  Returns the
    /// persisted id.
    ///
    /// Inline-encoded attachments are resolved to durable URLs *before*
    /// anything touches the messages table, so a failed upload leaves no
    /// partial state behind.
    pub async fn send(&self, sender: UserId, payload: SendMessagePayload) -> Result<MessageId> {
        let receiver_id = payload.receiver_id;

        let (sender_user, receiver) = {
            let db = self.store.lock().await;
            let sender_user = db.get_user(sender).map_err(lookup_err(sender))?;
            let receiver = db.get_user(receiver_id).map_err(lookup_err(receiver_id))?;
            (sender_user, receiver)
        };

        validate_send(&sender_user, &receiver)?;

        let (content, file_size, file_type) = self
            .resolve_content(payload.kind, payload.content, payload.file_size, payload.file_type)
            .await?;

        let message = Message {
            id: MessageId::new(),
            sender_id: sender,
            receiver_id,
            content,
            kind: payload.kind,
            file_name: payload.file_name,
            file_size,
            file_type,
            created_at: Utc::now(),
            read: false,
        };

        self.store
            .lock()
            .await
            .insert_message(&message)
            .map_err(|e| SignalError::Dependency(e.to_string()))?;

        info!(
            id = %message.id,
            from = %sender,
            to = %receiver_id,
            kind = message.kind.as_str(),
            "message persisted"
        );

        // Fan out to both rooms: other sender tabs update too.
        let wire = to_wire(&message);
        let delivery = ServerEvent::ReceiveMessage { message: wire };
        self.topics.publish(&sender.to_topic(), &delivery).await;
        let delivered = self.topics.publish(&receiver_id.to_topic(), &delivery).await;
        if delivered == 0 {
            debug!(to = %receiver_id, "receiver offline, message queued for replay");
        }

        self.topics
            .publish(
                &sender.to_topic(),
                &ServerEvent::UpdateMessages { counterpart_id: receiver_id },
            )
            .await;
        self.topics
            .publish(
                &receiver_id.to_topic(),
                &ServerEvent::UpdateMessages { counterpart_id: sender },
            )
            .await;

        // Keep unread counts and previews consistent on both sides.
        self.roster.push_roster(sender).await;
        self.roster.push_roster(receiver_id).await;

        Ok(message.id)
    }

    /// Full conversation with a counterpart, ascending.  Side effect:
    /// everything the counterpart sent the requester is marked read, and
    /// the counterpart's room is told per message so its UI can show
    /// "seen".
    pub async fn fetch(&self, requester: UserId, counterpart: UserId) -> Result<Vec<WireMessage>> {
        let (read_ids, history) = {
            let db = self.store.lock().await;
            db.get_user(counterpart).map_err(lookup_err(counterpart))?;

            let read_ids = db
                .mark_conversation_read(counterpart, requester)
                .map_err(|e| SignalError::Dependency(e.to_string()))?;
            let history = db
                .conversation(requester, counterpart)
                .map_err(|e| SignalError::Dependency(e.to_string()))?;
            (read_ids, history)
        };

        let counterpart_topic = counterpart.to_topic();
        for message_id in read_ids {
            self.topics
                .publish(
                    &counterpart_topic,
                    &ServerEvent::UpdateMessageStatus { message_id, read: true },
                )
                .await;
        }

        Ok(history.iter().map(to_wire).collect())
    }

    /// Atomically delete the bidirectional history with a counterpart and
    /// notify both parties.
    pub async fn clear(&self, requester: UserId, counterpart: UserId) -> Result<usize> {
        let deleted = {
            let db = self.store.lock().await;
            db.get_user(counterpart).map_err(lookup_err(counterpart))?;
            db.clear_conversation(requester, counterpart)
                .map_err(|e| SignalError::Dependency(e.to_string()))?
        };

        info!(a = %requester, b = %counterpart, deleted, "conversation cleared");

        self.topics
            .publish(
                &requester.to_topic(),
                &ServerEvent::UpdateMessages { counterpart_id: counterpart },
            )
            .await;
        self.topics
            .publish(
                &counterpart.to_topic(),
                &ServerEvent::UpdateMessages { counterpart_id: requester },
            )
            .await;

        self.roster.push_roster(requester).await;
        self.roster.push_roster(counterpart).await;

        Ok(deleted)
    }

    /// Replay every persisted-but-unread message to a freshly registered
    /// connection's room.  This is the offline-queue drain; `read` stays
    /// false until the user actually fetches the conversation.
    pub async fn replay_pending(&self, user: UserId) {
        let pending = match self.store.lock().await.pending_for(user) {
            Ok(pending) => pending,
            Err(e) => {
                warn!(user = %user, error = %e, "pending replay query failed");
                return;
            }
        };

        if pending.is_empty() {
            return;
        }

        debug!(user = %user, count = pending.len(), "replaying pending messages");
        let topic = user.to_topic();
        for message in &pending {
            self.topics
                .publish(&topic, &ServerEvent::ReceiveMessage { message: to_wire(message) })
                .await;
        }
    }

    /// Public profile view backing `getUserProfile`.
    pub async fn profile(&self, user_id: UserId) -> Result<UserProfile> {
        let user = self
            .store
            .lock()
            .await
            .get_user(user_id)
            .map_err(lookup_err(user_id))?;

        Ok(UserProfile {
            user_id: user.id,
            display_name: user.display_name,
            email: user.email,
            role: user.role,
            verified: user.verified,
            profile_image_url: user.profile_image_url,
            online: user.is_online,
        })
    }

    /// Resolve the message content: plain text is bounded by the text
    /// limit; inline blobs are size-checked *before* the upload, handed to
    /// attachment storage under a timeout, and replaced by the returned
    /// URL.
    async fn resolve_content(
        &self,
        kind: MessageKind,
        content: String,
        file_size: Option<i64>,
        file_type: Option<String>,
    ) -> Result<(String, Option<i64>, Option<String>)> {
        if content.is_empty() {
            return Err(SignalError::Validation("Message content is empty".to_string()));
        }

        let limit = self.config.limit_for(kind);

        if kind == MessageKind::Text {
            if content.len() > limit {
                return Err(SignalError::Validation(format!(
                    "Text message exceeds {limit} bytes"
                )));
            }
            return Ok((content, file_size, file_type));
        }

        let Some(decoded) = decode_inline(&content) else {
            // Already a URL (e.g. a client re-sending a stored attachment
            // reference); nothing to upload.
            return Ok((content, file_size, file_type));
        };
        let blob = decoded?;

        if blob.bytes.len() > limit {
            return Err(SignalError::Validation(format!(
                "{} exceeds {limit} bytes",
                kind.as_str()
            )));
        }

        let upload = self.attachments.store_blob(&blob.bytes);
        let url = tokio::time::timeout(self.config.dependency_timeout, upload)
            .await
            .map_err(|_| SignalError::Dependency("Attachment upload timed out".to_string()))??;

        let size = file_size.or(Some(blob.bytes.len() as i64));
        let mime = file_type.or(blob.mime);
        Ok((url, size, mime))
    }
}

/// Star-topology and verification checks, separated so they are testable
/// without a running pipeline.
fn validate_send(sender: &User, receiver: &User) -> Result<()> {
    if sender.id == receiver.id {
        return Err(SignalError::Validation(
            "Cannot send a message to yourself".to_string(),
        ));
    }
    if !receiver.verified {
        return Err(SignalError::Validation(format!(
            "Receiver {} is not verified",
            receiver.id
        )));
    }
    if sender.role == Role::User && receiver.role != Role::Admin {
        return Err(SignalError::Validation(
            "Users may only message admins".to_string(),
        ));
    }
    Ok(())
}

fn lookup_err(id: UserId) -> impl FnOnce(StoreError) -> SignalError {
    move |e| match e {
        StoreError::NotFound => SignalError::NotFound(format!("user {id}")),
        other => SignalError::Dependency(other.to_string()),
    }
}

/// Wire view of a persisted message.
pub fn to_wire(message: &Message) -> WireMessage {
    WireMessage {
        id: message.id,
        sender_id: message.sender_id,
        receiver_id: message.receiver_id,
        content: message.content.clone(),
        kind: message.kind,
        file_name: message.file_name.clone(),
        file_size: message.file_size,
        file_type: message.file_type.clone(),
        created_at: message.created_at,
        read: message.read,
    }
}

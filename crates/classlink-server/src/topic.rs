//! Explicit topic-based pub/sub.
//!
//! A topic is a named broadcast group holding the outbound channels of its
//! subscribed connections.  Everything above this layer (presence,
//! pipeline, call FSM) publishes events to topics and never touches the
//! transport, which keeps those components testable without a network
//! stack.  Closed channels are pruned on publish and on liveness probes,
//! so a crashed connection disappears from its rooms without an explicit
//! leave.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

use classlink_shared::error::Result;
use classlink_shared::protocol::ServerEvent;
use classlink_shared::SignalError;

/// Identifies one live connection (one socket, one tab).
pub type ConnId = Uuid;

/// Outbound channel of a connection; the ws layer drains it into the
/// socket.
pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

/// Topic every connection joins at handshake, used for presence fan-out.
pub const BROADCAST: &str = "broadcast";

#[derive(Clone, Default)]
pub struct Topics {
    inner: Arc<RwLock<HashMap<String, HashMap<ConnId, EventSender>>>>,
}

impl Topics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Subscribe a connection to a topic.
    ///
    /// Fails if the connection's outbound channel is already closed --
    /// this is the transient "torn down mid-join" case the registry
    /// retries on.  Re-subscribing an already-subscribed connection is a
    /// no-op, which makes registration idempotent under retry.
    pub async fn subscribe(&self, topic: &str, conn_id: ConnId, sender: EventSender) -> Result<()> {
        if sender.is_closed() {
            return Err(SignalError::Dependency(format!(
                "connection closed during join of '{topic}'"
            )));
        }

        let mut topics = self.inner.write().await;
        topics
            .entry(topic.to_string())
            .or_default()
            .insert(conn_id, sender);

        debug!(topic, conn = %conn_id, "subscribed");
        Ok(())
    }

    /// Remove a connection from one topic.  Empty topics are dropped.
    pub async fn unsubscribe(&self, topic: &str, conn_id: &ConnId) {
        let mut topics = self.inner.write().await;
        if let Some(members) = topics.get_mut(topic) {
            members.remove(conn_id);
            if members.is_empty() {
                topics.remove(topic);
            }
        }
    }

    /// Remove a connection from every topic it joined.
    pub async fn leave_all(&self, conn_id: &ConnId) {
        let mut topics = self.inner.write().await;
        topics.retain(|_, members| {
            members.remove(conn_id);
            !members.is_empty()
        });
    }

    /// Publish an event to every live member of a topic, pruning members
    /// whose channel has closed.  Returns the number of connections the
    /// event was handed to.
    pub async fn publish(&self, topic: &str, event: &ServerEvent) -> usize {
        let mut topics = self.inner.write().await;
        let Some(members) = topics.get_mut(topic) else {
            return 0;
        };

        let mut delivered = 0;
        members.retain(|conn_id, sender| {
            if sender.send(event.clone()).is_ok() {
                delivered += 1;
                true
            } else {
                debug!(topic, conn = %conn_id, "pruning closed connection");
                false
            }
        });

        if members.is_empty() {
            topics.remove(topic);
        }
        delivered
    }

    /// Number of members of a topic whose channel is still open.  This is
    /// the live-connection probe: closed channels are pruned, never
    /// counted.
    pub async fn live_count(&self, topic: &str) -> usize {
        let mut topics = self.inner.write().await;
        let Some(members) = topics.get_mut(topic) else {
            return 0;
        };

        members.retain(|_, sender| !sender.is_closed());
        let count = members.len();
        if count == 0 {
            topics.remove(topic);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use classlink_shared::types::UserId;

    fn channel() -> (EventSender, mpsc::UnboundedReceiver<ServerEvent>) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn publish_reaches_all_members() {
        let topics = Topics::new();
        let (tx1, mut rx1) = channel();
        let (tx2, mut rx2) = channel();

        topics.subscribe("room", Uuid::new_v4(), tx1).await.unwrap();
        topics.subscribe("room", Uuid::new_v4(), tx2).await.unwrap();

        let event = ServerEvent::OnlineStatus { online: vec![UserId::new()] };
        assert_eq!(topics.publish("room", &event).await, 2);

        assert!(matches!(rx1.try_recv().unwrap(), ServerEvent::OnlineStatus { .. }));
        assert!(matches!(rx2.try_recv().unwrap(), ServerEvent::OnlineStatus { .. }));
    }

    #[tokio::test]
    async fn closed_channel_is_pruned() {
        let topics = Topics::new();
        let conn = Uuid::new_v4();
        let (tx, rx) = channel();
        topics.subscribe("room", conn, tx).await.unwrap();

        drop(rx);
        assert_eq!(topics.live_count("room").await, 0);
        let event = ServerEvent::OnlineStatus { online: vec![] };
        assert_eq!(topics.publish("room", &event).await, 0);
    }

    #[tokio::test]
    async fn subscribe_rejects_closed_sender() {
        let topics = Topics::new();
        let (tx, rx) = channel();
        drop(rx);

        assert!(topics.subscribe("room", Uuid::new_v4(), tx).await.is_err());
    }

    #[tokio::test]
    async fn resubscribe_is_idempotent() {
        let topics = Topics::new();
        let conn = Uuid::new_v4();
        let (tx, mut rx) = channel();

        topics.subscribe("room", conn, tx.clone()).await.unwrap();
        topics.subscribe("room", conn, tx).await.unwrap();

        let event = ServerEvent::OnlineStatus { online: vec![] };
        assert_eq!(topics.publish("room", &event).await, 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn leave_all_clears_every_room() {
        let topics = Topics::new();
        let conn = Uuid::new_v4();
        let (tx, _rx) = channel();

        topics.subscribe("a", conn, tx.clone()).await.unwrap();
        topics.subscribe("b", conn, tx).await.unwrap();

        topics.leave_all(&conn).await;
        assert_eq!(topics.live_count("a").await, 0);
        assert_eq!(topics.live_count("b").await, 0);
    }
}

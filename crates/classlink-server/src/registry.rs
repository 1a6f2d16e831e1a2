//! Session registry: who is connected, and where.
//!
//! Maps authenticated users to their live connections by joining each
//! connection to the user's room and the global broadcast topic.  The
//! registry is process-local and rebuilt empty on restart; only the
//! durable online flag survives, and that flag is never trusted for
//! reachability decisions -- [`SessionRegistry::is_reachable`] probes the
//! live channels instead.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use classlink_shared::error::Result;
use classlink_shared::types::UserId;

use crate::topic::{ConnId, EventSender, Topics, BROADCAST};

#[derive(Clone)]
pub struct SessionRegistry {
    topics: Topics,
    conns: Arc<RwLock<HashMap<ConnId, UserId>>>,
    join_attempts: u32,
    join_backoff: Duration,
}

impl SessionRegistry {
    pub fn new(topics: Topics, join_attempts: u32, join_backoff: Duration) -> Self {
        Self {
            topics,
            conns: Arc::new(RwLock::new(HashMap::new())),
            join_attempts: join_attempts.max(1),
            join_backoff,
        }
    }

    /// Join a connection to its user room and the broadcast topic.
    ///
    /// Idempotent under retry.  The room join can fail transiently when
    /// the connection is torn down mid-join; registration retries with
    /// doubling backoff and, once attempts are exhausted, reports the
    /// failure so the transport can emit `rejoinFailed` and wait for an
    /// explicit client `rejoinRooms`.
    pub async fn register(
        &self,
        user: UserId,
        conn_id: ConnId,
        sender: EventSender,
    ) -> Result<()> {
        let topic = user.to_topic();
        let mut backoff = self.join_backoff;
        let mut last_err = None;

        for attempt in 1..=self.join_attempts {
            let joined = self
                .topics
                .subscribe(&topic, conn_id, sender.clone())
                .await
                .and(self.topics.subscribe(BROADCAST, conn_id, sender.clone()).await);

            match joined {
                Ok(()) => {
                    self.conns.write().await.insert(conn_id, user);
                    debug!(user = %user, conn = %conn_id, attempt, "registered connection");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        user = %user,
                        conn = %conn_id,
                        attempt,
                        error = %e,
                        "room join failed"
                    );
                    last_err = Some(e);
                    if attempt < self.join_attempts {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            classlink_shared::SignalError::Dependency("room join failed".to_string())
        }))
    }

    /// Remove a connection from the registry and every room it joined.
    ///
    /// Returns the user it belonged to and whether it was that user's last
    /// live connection (the caller flips the durable flag only then).
    pub async fn unregister(&self, conn_id: &ConnId) -> Option<(UserId, bool)> {
        let user = self.conns.write().await.remove(conn_id)?;
        self.topics.leave_all(conn_id).await;

        let last = self.topics.live_count(&user.to_topic()).await == 0;
        debug!(user = %user, conn = %conn_id, last, "unregistered connection");
        Some((user, last))
    }

    /// Live-connection probe: true iff at least one open channel is
    /// currently joined to the user's room.  Deliberately ignores the
    /// durable online flag, which may be stale after a crash.
    pub async fn is_reachable(&self, user: UserId) -> bool {
        self.topics.live_count(&user.to_topic()).await > 0
    }

    /// Distinct users with at least one live connection.
    pub async fn online_users(&self) -> Vec<UserId> {
        let candidates: Vec<UserId> = {
            let conns = self.conns.read().await;
            let mut seen = Vec::new();
            for user in conns.values() {
                if !seen.contains(user) {
                    seen.push(*user);
                }
            }
            seen
        };

        let mut online = Vec::new();
        for user in candidates {
            if self.is_reachable(user).await {
                online.push(user);
            }
        }
        online
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Topics::new(), 3, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn register_then_reachable() {
        let reg = registry();
        let user = UserId::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        reg.register(user, Uuid::new_v4(), tx).await.unwrap();
        assert!(reg.is_reachable(user).await);
        assert_eq!(reg.online_users().await, vec![user]);
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let reg = registry();
        let user = UserId::new();
        let conn = Uuid::new_v4();
        let (tx, _rx) = mpsc::unbounded_channel();

        reg.register(user, conn, tx.clone()).await.unwrap();
        reg.register(user, conn, tx).await.unwrap();
        assert_eq!(reg.online_users().await, vec![user]);
    }

    #[tokio::test]
    async fn register_fails_after_exhausted_retries() {
        let reg = registry();
        let user = UserId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx); // channel closed: every join attempt fails

        let result = reg.register(user, Uuid::new_v4(), tx).await;
        assert!(result.is_err());
        assert!(!reg.is_reachable(user).await);
    }

    #[tokio::test]
    async fn last_connection_detection() {
        let reg = registry();
        let user = UserId::new();
        let conn_a = Uuid::new_v4();
        let conn_b = Uuid::new_v4();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();

        reg.register(user, conn_a, tx_a).await.unwrap();
        reg.register(user, conn_b, tx_b).await.unwrap();

        // Two tabs: closing one must not mark the user offline.
        let (_, last) = reg.unregister(&conn_a).await.unwrap();
        assert!(!last);
        assert!(reg.is_reachable(user).await);

        let (_, last) = reg.unregister(&conn_b).await.unwrap();
        assert!(last);
        assert!(!reg.is_reachable(user).await);
    }

    #[tokio::test]
    async fn dropped_channel_makes_user_unreachable() {
        let reg = registry();
        let user = UserId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        reg.register(user, Uuid::new_v4(), tx).await.unwrap();

        // Abrupt death: the socket task is gone but unregister never ran.
        drop(rx);
        assert!(!reg.is_reachable(user).await);
        assert!(reg.online_users().await.is_empty());
    }
}

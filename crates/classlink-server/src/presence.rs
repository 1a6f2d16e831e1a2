//! Presence tracking.
//!
//! Persists online/offline transitions in the durable store and fans the
//! full online set out to every connection.  Event-driven broadcasts can
//! be lost to races between concurrent connects/disconnects of the same
//! user (two tabs), so a fixed-interval sweep rebroadcasts the current
//! state and repairs durable flags left stale by a crash-without-
//! disconnect.  Consumers that need real reachability (call relay) use
//! the registry probe, never the flag.

use tracing::{debug, warn};

use classlink_shared::error::Result;
use classlink_shared::protocol::ServerEvent;
use classlink_shared::types::UserId;
use classlink_shared::SignalError;

use crate::api::SharedStore;
use crate::registry::SessionRegistry;
use crate::topic::{Topics, BROADCAST};

#[derive(Clone)]
pub struct PresenceTracker {
    store: SharedStore,
    registry: SessionRegistry,
    topics: Topics,
}

impl PresenceTracker {
    pub fn new(store: SharedStore, registry: SessionRegistry, topics: Topics) -> Self {
        Self {
            store,
            registry,
            topics,
        }
    }

    /// Record a user as online and rebroadcast the online set.  Called on
    /// every successful registration; flipping an already-true flag is
    /// harmless.
    pub async fn mark_online(&self, user: UserId) -> Result<()> {
        self.store
            .lock()
            .await
            .set_online(user, true)
            .map_err(|e| SignalError::Dependency(e.to_string()))?;
        debug!(user = %user, "marked online");

        self.broadcast_online().await;
        Ok(())
    }

    /// Record a user as offline (last connection gone) and rebroadcast.
    pub async fn mark_offline(&self, user: UserId) -> Result<()> {
        self.store
            .lock()
            .await
            .set_online(user, false)
            .map_err(|e| SignalError::Dependency(e.to_string()))?;
        debug!(user = %user, "marked offline");

        self.broadcast_online().await;
        Ok(())
    }

    /// Push the current online set to every connection.
    pub async fn broadcast_online(&self) {
        let online = self.registry.online_users().await;
        let event = ServerEvent::OnlineStatus { online };
        self.topics.publish(BROADCAST, &event).await;
    }

    /// One iteration of the periodic sweep: reconcile durable flags
    /// against live connections, then rebroadcast.  Run on a fixed
    /// interval independent of discrete connect/disconnect events.
    pub async fn sweep_once(&self) {
        let online = self.registry.online_users().await;

        if let Err(e) = self.store.lock().await.reconcile_online(&online) {
            warn!(error = %e, "presence reconcile failed");
        }

        let event = ServerEvent::OnlineStatus { online };
        self.topics.publish(BROADCAST, &event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use tokio::sync::{mpsc, Mutex};
    use uuid::Uuid;

    use classlink_shared::types::Role;
    use classlink_store::{Database, User};

    fn seed_user(db: &Database) -> UserId {
        let id = UserId::new();
        db.create_user(&User {
            id,
            display_name: format!("u-{}", &id.to_string()[..8]),
            email: format!("{id}@example.edu"),
            role: Role::User,
            verified: true,
            profile_image_url: None,
            is_online: false,
            created_at: Utc::now(),
        })
        .unwrap();
        id
    }

    fn fixture() -> (PresenceTracker, SessionRegistry, SharedStore, Topics) {
        let store: SharedStore = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let topics = Topics::new();
        let registry = SessionRegistry::new(topics.clone(), 3, Duration::from_millis(1));
        let presence = PresenceTracker::new(store.clone(), registry.clone(), topics.clone());
        (presence, registry, store, topics)
    }

    #[tokio::test]
    async fn online_transition_sets_flag_and_broadcasts() {
        let (presence, registry, store, _topics) = fixture();
        let user = seed_user(&*store.lock().await);

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(user, Uuid::new_v4(), tx).await.unwrap();
        presence.mark_online(user).await.unwrap();

        assert_eq!(store.lock().await.online_user_ids().unwrap(), vec![user]);
        match rx.try_recv().unwrap() {
            ServerEvent::OnlineStatus { online } => assert_eq!(online, vec![user]),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn sweep_repairs_crashed_connection_flag() {
        let (presence, _registry, store, _topics) = fixture();
        let user = seed_user(&*store.lock().await);

        // Crash-without-disconnect: durable flag says online, registry
        // has no live connection.
        store.lock().await.set_online(user, true).unwrap();

        presence.sweep_once().await;
        assert!(store.lock().await.online_user_ids().unwrap().is_empty());
    }
}

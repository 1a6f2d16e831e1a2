//! Roster computation.
//!
//! The roster is the per-user list of message-able counterparts: admins
//! see every verified user, users see only verified admins (the star
//! topology).  Each row is annotated with unread count, last-message
//! preview, favorite flag and the durable online flag -- the roster is
//! eventually consistent and never the source of truth for
//! deliverability.

use tracing::warn;

use classlink_shared::error::Result;
use classlink_shared::protocol::{RosterEntry, ServerEvent};
use classlink_shared::types::{Role, UserId};
use classlink_shared::SignalError;

use crate::api::SharedStore;
use crate::topic::Topics;

#[derive(Clone)]
pub struct RosterService {
    store: SharedStore,
    topics: Topics,
}

impl RosterService {
    pub fn new(store: SharedStore, topics: Topics) -> Self {
        Self { store, topics }
    }

    /// Compute the roster for a requester.
    ///
    /// Sorted by latest-message timestamp descending; counterparts with no
    /// conversation yet sink to the bottom.
    pub async fn roster_for(&self, requester: UserId) -> Result<Vec<RosterEntry>> {
        let db = self.store.lock().await;

        let me = db.get_user(requester).map_err(|e| match e {
            classlink_store::StoreError::NotFound => {
                SignalError::NotFound(format!("user {requester}"))
            }
            other => SignalError::Dependency(other.to_string()),
        })?;

        let candidates = if me.role.is_admin() {
            db.list_verified()
        } else {
            db.list_verified_by_role(Role::Admin)
        }
        .map_err(|e| SignalError::Dependency(e.to_string()))?;

        let favorites = db
            .favorites_of(requester)
            .map_err(|e| SignalError::Dependency(e.to_string()))?;

        let mut entries = Vec::new();
        for candidate in candidates.into_iter().filter(|c| c.id != requester) {
            let unread = db
                .unread_count(candidate.id, requester)
                .map_err(|e| SignalError::Dependency(e.to_string()))?;
            let latest = db
                .latest_between(requester, candidate.id)
                .map_err(|e| SignalError::Dependency(e.to_string()))?;

            entries.push(RosterEntry {
                user_id: candidate.id,
                display_name: candidate.display_name,
                role: candidate.role,
                profile_image_url: candidate.profile_image_url,
                unread_count: unread,
                last_message: latest.as_ref().map(|m| m.content.clone()),
                last_message_at: latest.map(|m| m.created_at),
                favorite: favorites.contains(&candidate.id),
                online: candidate.is_online,
            });
        }

        // `None < Some(_)`, so descending order puts untouched
        // conversations last.
        entries.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        Ok(entries)
    }

    /// Flip favorite membership for (requester, target).  Returns the new
    /// state and re-pushes the roster to the requester only.
    pub async fn toggle_favorite(&self, requester: UserId, target: UserId) -> Result<bool> {
        let now_favorite = {
            let db = self.store.lock().await;

            db.get_user(target).map_err(|e| match e {
                classlink_store::StoreError::NotFound => {
                    SignalError::NotFound(format!("user {target}"))
                }
                other => SignalError::Dependency(other.to_string()),
            })?;

            // Set-add first; zero affected rows means the membership
            // already existed, so this toggle removes it.
            let added = db
                .add_favorite(requester, target)
                .map_err(|e| SignalError::Dependency(e.to_string()))?;
            if added {
                true
            } else {
                db.remove_favorite(requester, target)
                    .map_err(|e| SignalError::Dependency(e.to_string()))?;
                false
            }
        };

        self.push_roster(requester).await;
        Ok(now_favorite)
    }

    /// Compute and emit `updateUsers` to every connection of one user.
    pub async fn push_roster(&self, user: UserId) {
        match self.roster_for(user).await {
            Ok(users) => {
                self.topics
                    .publish(&user.to_topic(), &ServerEvent::UpdateUsers { users })
                    .await;
            }
            Err(e) => warn!(user = %user, error = %e, "roster push failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use tokio::sync::Mutex;

    use classlink_shared::types::{MessageId, MessageKind};
    use classlink_store::{Database, Message, User};

    fn seed_user(db: &Database, role: Role, verified: bool, name: &str) -> UserId {
        let id = UserId::new();
        db.create_user(&User {
            id,
            display_name: name.to_string(),
            email: format!("{id}@example.edu"),
            role,
            verified,
            profile_image_url: None,
            is_online: false,
            created_at: Utc::now(),
        })
        .unwrap();
        id
    }

    fn seed_message(db: &Database, from: UserId, to: UserId, content: &str, age_mins: i64) {
        db.insert_message(&Message {
            id: MessageId::new(),
            sender_id: from,
            receiver_id: to,
            content: content.to_string(),
            kind: MessageKind::Text,
            file_name: None,
            file_size: None,
            file_type: None,
            created_at: Utc::now() - Duration::minutes(age_mins),
            read: false,
        })
        .unwrap();
    }

    fn service() -> (RosterService, SharedStore) {
        let store: SharedStore = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let roster = RosterService::new(store.clone(), Topics::new());
        (roster, store)
    }

    #[tokio::test]
    async fn star_topology_visibility() {
        let (roster, store) = service();
        let (student, admin, other_student) = {
            let db = store.lock().await;
            (
                seed_user(&db, Role::User, true, "student"),
                seed_user(&db, Role::Admin, true, "admin"),
                seed_user(&db, Role::User, true, "other"),
            )
        };

        // Students see only admins.
        let seen = roster.roster_for(student).await.unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].user_id, admin);

        // Admins see everyone verified (minus self).
        let seen = roster.roster_for(admin).await.unwrap();
        let ids: Vec<UserId> = seen.iter().map(|e| e.user_id).collect();
        assert!(ids.contains(&student));
        assert!(ids.contains(&other_student));
        assert!(!ids.contains(&admin));
    }

    #[tokio::test]
    async fn sorted_by_latest_message_with_empty_last() {
        let (roster, store) = service();
        let (admin, a, b, c) = {
            let db = store.lock().await;
            let admin = seed_user(&db, Role::Admin, true, "admin");
            let a = seed_user(&db, Role::User, true, "a");
            let b = seed_user(&db, Role::User, true, "b");
            let c = seed_user(&db, Role::User, true, "c");
            // A last heard from an hour ago, B ten minutes ago, C never.
            seed_message(&db, a, admin, "old", 60);
            seed_message(&db, b, admin, "new", 10);
            (admin, a, b, c)
        };

        let entries = roster.roster_for(admin).await.unwrap();
        let ids: Vec<UserId> = entries.iter().map(|e| e.user_id).collect();
        assert_eq!(ids, vec![b, a, c]);
        assert_eq!(entries[0].unread_count, 1);
        assert_eq!(entries[0].last_message.as_deref(), Some("new"));
        assert!(entries[2].last_message.is_none());
    }

    #[tokio::test]
    async fn toggle_favorite_twice_returns_to_original() {
        let (roster, store) = service();
        let (student, admin) = {
            let db = store.lock().await;
            (
                seed_user(&db, Role::User, true, "student"),
                seed_user(&db, Role::Admin, true, "admin"),
            )
        };

        assert!(roster.toggle_favorite(student, admin).await.unwrap());
        assert!(!roster.toggle_favorite(student, admin).await.unwrap());
        assert!(!store.lock().await.is_favorite(student, admin).unwrap());
    }

    #[tokio::test]
    async fn toggle_favorite_unknown_target() {
        let (roster, store) = service();
        let student = seed_user(&*store.lock().await, Role::User, true, "student");

        let result = roster.toggle_favorite(student, UserId::new()).await;
        assert!(matches!(result, Err(SignalError::NotFound(_))));
    }
}

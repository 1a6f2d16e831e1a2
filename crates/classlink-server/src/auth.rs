//! Bearer-token authentication.
//!
//! Tokens are issued by the platform's account system and only *validated*
//! here, by lookup in the durable token table.  Authentication failures
//! abort the connection before any room join.

use axum::http::HeaderMap;

use classlink_shared::error::Result;
use classlink_shared::types::{Role, UserId};
use classlink_shared::SignalError;

use classlink_store::StoreError;

use crate::api::SharedStore;

/// A verified identity attached to a connection for its whole lifetime.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: UserId,
    pub role: Role,
    pub display_name: String,
}

#[derive(Clone)]
pub struct Authenticator {
    store: SharedStore,
}

impl Authenticator {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Resolve a bearer token to a verified identity.
    pub async fn authenticate(&self, token: &str) -> Result<Identity> {
        if token.is_empty() {
            return Err(SignalError::Authentication("Missing bearer token".to_string()));
        }

        let db = self.store.lock().await;

        let user_id = db.user_for_token(token).map_err(|e| match e {
            StoreError::NotFound => SignalError::Authentication("Invalid bearer token".to_string()),
            other => SignalError::Dependency(other.to_string()),
        })?;

        let user = db.get_user(user_id).map_err(|e| match e {
            StoreError::NotFound => SignalError::Authentication("Unknown account".to_string()),
            other => SignalError::Dependency(other.to_string()),
        })?;

        if !user.verified {
            return Err(SignalError::Authentication("Account not verified".to_string()));
        }

        Ok(Identity {
            user_id: user.id,
            role: user.role,
            display_name: user.display_name,
        })
    }
}

/// Extract a bearer token from the `Authorization` header.
pub fn bearer_from_headers(headers: &HeaderMap) -> Option<String> {
    let auth = headers.get("authorization")?.to_str().ok()?;
    let token = auth.strip_prefix("Bearer ").unwrap_or(auth).trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;
    use tokio::sync::Mutex;

    use classlink_store::{AuthToken, Database, User};

    async fn seeded() -> (Authenticator, UserId) {
        let db = Database::open_in_memory().unwrap();
        let user_id = UserId::new();
        db.create_user(&User {
            id: user_id,
            display_name: "student".into(),
            email: "student@example.edu".into(),
            role: Role::User,
            verified: true,
            profile_image_url: None,
            is_online: false,
            created_at: Utc::now(),
        })
        .unwrap();
        db.insert_token(&AuthToken {
            token: "valid-token".into(),
            user_id,
            created_at: Utc::now(),
        })
        .unwrap();

        let store: SharedStore = Arc::new(Mutex::new(db));
        (Authenticator::new(store), user_id)
    }

    #[tokio::test]
    async fn valid_token_resolves_identity() {
        let (auth, user_id) = seeded().await;
        let identity = auth.authenticate("valid-token").await.unwrap();
        assert_eq!(identity.user_id, user_id);
        assert_eq!(identity.role, Role::User);
    }

    #[tokio::test]
    async fn invalid_or_missing_token_rejected() {
        let (auth, _) = seeded().await;
        assert!(matches!(
            auth.authenticate("bogus").await,
            Err(SignalError::Authentication(_))
        ));
        assert!(matches!(
            auth.authenticate("").await,
            Err(SignalError::Authentication(_))
        ));
    }

    #[test]
    fn bearer_header_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer abc123".parse().unwrap());
        assert_eq!(bearer_from_headers(&headers).as_deref(), Some("abc123"));

        let empty = HeaderMap::new();
        assert!(bearer_from_headers(&empty).is_none());
    }
}

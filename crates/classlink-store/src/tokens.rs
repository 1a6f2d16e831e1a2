//! Bearer-token lookups.
//!
//! Tokens are issued by the platform's account system; the real-time core
//! only resolves them to a user id at handshake.

use rusqlite::params;

use classlink_shared::types::UserId;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::AuthToken;

impl Database {
    /// Record a token issued for a user.
    pub fn insert_token(&self, token: &AuthToken) -> Result<()> {
        self.conn().execute(
            "INSERT INTO auth_tokens (token, user_id, created_at) VALUES (?1, ?2, ?3)",
            params![
                token.token,
                token.user_id.to_string(),
                token.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Resolve a bearer token to its user id.
    pub fn user_for_token(&self, token: &str) -> Result<UserId> {
        self.conn()
            .query_row(
                "SELECT user_id FROM auth_tokens WHERE token = ?1",
                params![token],
                |row| {
                    let id_str: String = row.get(0)?;
                    UserId::parse(&id_str).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            0,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })
                },
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Delete a token.  Returns `true` if a row was removed.
    pub fn revoke_token(&self, token: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM auth_tokens WHERE token = ?1", params![token])?;
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use classlink_shared::types::Role;
    use crate::models::User;

    #[test]
    fn token_round_trip() {
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

        let token = AuthToken {
            token: "opaque-bearer-token".into(),
            user_id,
            created_at: Utc::now(),
        };
        db.insert_token(&token).unwrap();

        assert_eq!(db.user_for_token("opaque-bearer-token").unwrap(), user_id);
        assert!(matches!(
            db.user_for_token("unknown"),
            Err(StoreError::NotFound)
        ));

        assert!(db.revoke_token("opaque-bearer-token").unwrap());
        assert!(!db.revoke_token("opaque-bearer-token").unwrap());
    }
}

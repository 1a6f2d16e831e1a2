//! CRUD operations for [`User`] records, the durable presence flag and the
//! favorites set.

use chrono::{DateTime, Utc};
use rusqlite::params;

use classlink_shared::types::{Role, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::User;

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a new user.
    pub fn create_user(&self, user: &User) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users (id, display_name, email, role, verified, profile_image_url, is_online, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                user.id.to_string(),
                user.display_name,
                user.email,
                user.role.as_str(),
                user.verified,
                user.profile_image_url,
                user.is_online,
                user.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single user by id.
    pub fn get_user(&self, id: UserId) -> Result<User> {
        self.conn()
            .query_row(
                "SELECT id, display_name, email, role, verified, profile_image_url, is_online, created_at
                 FROM users
                 WHERE id = ?1",
                params![id.to_string()],
                row_to_user,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// List every verified user, ordered by display name.
    pub fn list_verified(&self) -> Result<Vec<User>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, display_name, email, role, verified, profile_image_url, is_online, created_at
             FROM users
             WHERE verified = 1
             ORDER BY display_name ASC",
        )?;

        let rows = stmt.query_map([], row_to_user)?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }

    /// List verified users holding a specific role, ordered by display name.
    pub fn list_verified_by_role(&self, role: Role) -> Result<Vec<User>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, display_name, email, role, verified, profile_image_url, is_online, created_at
             FROM users
             WHERE verified = 1 AND role = ?1
             ORDER BY display_name ASC",
        )?;

        let rows = stmt.query_map(params![role.as_str()], row_to_user)?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }

    // ------------------------------------------------------------------
    // Presence flag
    // ------------------------------------------------------------------

    /// Set the durable online flag for one user.
    pub fn set_online(&self, id: UserId, online: bool) -> Result<()> {
        self.conn().execute(
            "UPDATE users SET is_online = ?1 WHERE id = ?2",
            params![online, id.to_string()],
        )?;
        Ok(())
    }

    /// Ids of users whose durable flag currently reads online.
    pub fn online_user_ids(&self) -> Result<Vec<UserId>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT id FROM users WHERE is_online = 1")?;

        let rows = stmt.query_map([], |row| {
            let id_str: String = row.get(0)?;
            UserId::parse(&id_str).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
            })
        })?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Overwrite every durable flag so that exactly the given users read
    /// online.  Used by the presence sweep to repair flags left stale by a
    /// crash-without-disconnect.
    pub fn reconcile_online(&self, online: &[UserId]) -> Result<()> {
        let tx = self.conn().unchecked_transaction()?;
        tx.execute("UPDATE users SET is_online = 0 WHERE is_online = 1", [])?;
        {
            let mut stmt = tx.prepare("UPDATE users SET is_online = 1 WHERE id = ?1")?;
            for id in online {
                stmt.execute(params![id.to_string()])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Favorites (set-add / set-remove, never read-modify-write)
    // ------------------------------------------------------------------

    /// Add a user to the requester's favorites.  Returns `false` if the
    /// membership already existed.
    pub fn add_favorite(&self, user_id: UserId, favorite_id: UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO favorites (user_id, favorite_id) VALUES (?1, ?2)",
            params![user_id.to_string(), favorite_id.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// Remove a user from the requester's favorites.  Returns `false` if
    /// there was no membership to remove.
    pub fn remove_favorite(&self, user_id: UserId, favorite_id: UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM favorites WHERE user_id = ?1 AND favorite_id = ?2",
            params![user_id.to_string(), favorite_id.to_string()],
        )?;
        Ok(affected > 0)
    }

    pub fn is_favorite(&self, user_id: UserId, favorite_id: UserId) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM favorites WHERE user_id = ?1 AND favorite_id = ?2",
            params![user_id.to_string(), favorite_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// The requester's full favorites set.
    pub fn favorites_of(&self, user_id: UserId) -> Result<Vec<UserId>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT favorite_id FROM favorites WHERE user_id = ?1")?;

        let rows = stmt.query_map(params![user_id.to_string()], |row| {
            let id_str: String = row.get(0)?;
            UserId::parse(&id_str).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
            })
        })?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a `rusqlite::Row` to a [`User`].
fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let id_str: String = row.get(0)?;
    let display_name: String = row.get(1)?;
    let email: String = row.get(2)?;
    let role_str: String = row.get(3)?;
    let verified: bool = row.get(4)?;
    let profile_image_url: Option<String> = row.get(5)?;
    let is_online: bool = row.get(6)?;
    let created_str: String = row.get(7)?;

    let id = UserId::parse(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let role = Role::parse(&role_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&created_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(User {
        id,
        display_name,
        email,
        role,
        verified,
        profile_image_url,
        is_online,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_user(role: Role, verified: bool) -> User {
        let id = UserId::new();
        User {
            id,
            display_name: format!("user-{}", &id.to_string()[..8]),
            email: format!("{id}@example.edu"),
            role,
            verified,
            profile_image_url: None,
            is_online: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn create_and_get() {
        let db = Database::open_in_memory().unwrap();
        let user = test_user(Role::Admin, true);

        db.create_user(&user).unwrap();
        let fetched = db.get_user(user.id).unwrap();
        assert_eq!(fetched, user);
    }

    #[test]
    fn missing_user_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            db.get_user(UserId::new()),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn list_verified_filters_unverified() {
        let db = Database::open_in_memory().unwrap();
        let verified = test_user(Role::User, true);
        let unverified = test_user(Role::User, false);
        db.create_user(&verified).unwrap();
        db.create_user(&unverified).unwrap();

        let listed = db.list_verified().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, verified.id);
    }

    #[test]
    fn online_flag_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let user = test_user(Role::User, true);
        db.create_user(&user).unwrap();

        db.set_online(user.id, true).unwrap();
        assert_eq!(db.online_user_ids().unwrap(), vec![user.id]);

        db.set_online(user.id, false).unwrap();
        assert!(db.online_user_ids().unwrap().is_empty());
    }

    #[test]
    fn reconcile_repairs_stale_flags() {
        let db = Database::open_in_memory().unwrap();
        let stale = test_user(Role::User, true);
        let live = test_user(Role::Admin, true);
        db.create_user(&stale).unwrap();
        db.create_user(&live).unwrap();

        // Simulate a crash that left `stale` marked online.
        db.set_online(stale.id, true).unwrap();

        db.reconcile_online(&[live.id]).unwrap();
        assert_eq!(db.online_user_ids().unwrap(), vec![live.id]);
    }

    #[test]
    fn favorite_set_semantics() {
        let db = Database::open_in_memory().unwrap();
        let a = test_user(Role::User, true);
        let b = test_user(Role::Admin, true);
        db.create_user(&a).unwrap();
        db.create_user(&b).unwrap();

        assert!(db.add_favorite(a.id, b.id).unwrap());
        // Second add is a no-op, not an error.
        assert!(!db.add_favorite(a.id, b.id).unwrap());
        assert!(db.is_favorite(a.id, b.id).unwrap());
        assert_eq!(db.favorites_of(a.id).unwrap(), vec![b.id]);

        assert!(db.remove_favorite(a.id, b.id).unwrap());
        assert!(!db.remove_favorite(a.id, b.id).unwrap());
        assert!(!db.is_favorite(a.id, b.id).unwrap());
    }
}

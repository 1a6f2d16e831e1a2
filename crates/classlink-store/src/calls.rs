//! CRUD operations for [`Call`] records.
//!
//! Status changes go through [`Database::transition_call`], a single
//! compare-and-set statement: of two racing transitions only the first
//! wins, the loser sees zero affected rows and reports a conflict.

use chrono::{DateTime, Utc};
use rusqlite::params;

use classlink_shared::types::{CallId, CallStatus, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Call;

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a new call record.
    pub fn insert_call(&self, call: &Call) -> Result<()> {
        self.conn().execute(
            "INSERT INTO calls (id, caller_id, receiver_id, offer, status, created_at, updated_at, started_at, ended_at, duration_secs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                call.id.to_string(),
                call.caller_id.to_string(),
                call.receiver_id.to_string(),
                call.offer,
                call.status.as_str(),
                call.created_at.to_rfc3339(),
                call.updated_at.to_rfc3339(),
                call.started_at.map(|t| t.to_rfc3339()),
                call.ended_at.map(|t| t.to_rfc3339()),
                call.duration_secs,
            ],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single call by id.
    pub fn get_call(&self, id: CallId) -> Result<Call> {
        self.conn()
            .query_row(
                &format!("{SELECT_CALL} WHERE id = ?1"),
                params![id.to_string()],
                row_to_call,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Call history between the pair, newest first.
    pub fn calls_between(&self, a: UserId, b: UserId) -> Result<Vec<Call>> {
        let mut stmt = self.conn().prepare(&format!(
            "{SELECT_CALL}
             WHERE (caller_id = ?1 AND receiver_id = ?2)
                OR (caller_id = ?2 AND receiver_id = ?1)
             ORDER BY created_at DESC"
        ))?;

        let rows = stmt.query_map(params![a.to_string(), b.to_string()], row_to_call)?;

        let mut calls = Vec::new();
        for row in rows {
            calls.push(row?);
        }
        Ok(calls)
    }

    /// Every call the user took part in, newest first.  Backs the
    /// read-only history endpoint.
    pub fn calls_for_user(&self, user: UserId) -> Result<Vec<Call>> {
        let mut stmt = self.conn().prepare(&format!(
            "{SELECT_CALL}
             WHERE caller_id = ?1 OR receiver_id = ?1
             ORDER BY created_at DESC"
        ))?;

        let rows = stmt.query_map(params![user.to_string()], row_to_call)?;

        let mut calls = Vec::new();
        for row in rows {
            calls.push(row?);
        }
        Ok(calls)
    }

    // ------------------------------------------------------------------
    // Update (compare-and-set)
    // ------------------------------------------------------------------

    /// Atomically transition a call from `expected` to `next`.
    ///
    /// Returns `true` iff this caller won the transition.  `started_at`,
    /// `ended_at` and `duration_secs` are only written when provided, so
    /// fields set by earlier transitions survive later ones.
    pub fn transition_call(
        &self,
        id: CallId,
        expected: CallStatus,
        next: CallStatus,
        started_at: Option<DateTime<Utc>>,
        ended_at: Option<DateTime<Utc>>,
        duration_secs: Option<i64>,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE calls SET
                 status        = ?3,
                 updated_at    = ?4,
                 started_at    = COALESCE(?5, started_at),
                 ended_at      = COALESCE(?6, ended_at),
                 duration_secs = COALESCE(?7, duration_secs)
             WHERE id = ?1 AND status = ?2",
            params![
                id.to_string(),
                expected.as_str(),
                next.as_str(),
                Utc::now().to_rfc3339(),
                started_at.map(|t| t.to_rfc3339()),
                ended_at.map(|t| t.to_rfc3339()),
                duration_secs,
            ],
        )?;
        Ok(affected > 0)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const SELECT_CALL: &str = "SELECT id, caller_id, receiver_id, offer, status, created_at, updated_at, started_at, ended_at, duration_secs FROM calls";

/// Map a `rusqlite::Row` to a [`Call`].
fn row_to_call(row: &rusqlite::Row<'_>) -> rusqlite::Result<Call> {
    let id_str: String = row.get(0)?;
    let caller_str: String = row.get(1)?;
    let receiver_str: String = row.get(2)?;
    let offer: String = row.get(3)?;
    let status_str: String = row.get(4)?;
    let created_str: String = row.get(5)?;
    let updated_str: String = row.get(6)?;
    let started_str: Option<String> = row.get(7)?;
    let ended_str: Option<String> = row.get(8)?;
    let duration_secs: i64 = row.get(9)?;

    let id = CallId::parse(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let caller_id = UserId::parse(&caller_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let receiver_id = UserId::parse(&receiver_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let status = CallStatus::parse(&status_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let created_at = parse_ts(&created_str, 5)?;
    let updated_at = parse_ts(&updated_str, 6)?;
    let started_at = started_str.as_deref().map(|s| parse_ts(s, 7)).transpose()?;
    let ended_at = ended_str.as_deref().map(|s| parse_ts(s, 8)).transpose()?;

    Ok(Call {
        id,
        caller_id,
        receiver_id,
        offer,
        status,
        created_at,
        updated_at,
        started_at,
        ended_at,
        duration_secs,
    })
}

fn parse_ts(s: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use classlink_shared::types::Role;
    use crate::models::User;

    fn seed_user(db: &Database, role: Role) -> UserId {
        let id = UserId::new();
        db.create_user(&User {
            id,
            display_name: format!("u-{}", &id.to_string()[..8]),
            email: format!("{id}@example.edu"),
            role,
            verified: true,
            profile_image_url: None,
            is_online: false,
            created_at: Utc::now(),
        })
        .unwrap();
        id
    }

    fn pending_call(db: &Database, caller: UserId, receiver: UserId) -> Call {
        let now = Utc::now();
        let call = Call {
            id: CallId::new(),
            caller_id: caller,
            receiver_id: receiver,
            offer: "v=0 o=- fake sdp".into(),
            status: CallStatus::Pending,
            created_at: now,
            updated_at: now,
            started_at: None,
            ended_at: None,
            duration_secs: 0,
        };
        db.insert_call(&call).unwrap();
        call
    }

    #[test]
    fn insert_and_get() {
        let db = Database::open_in_memory().unwrap();
        let a = seed_user(&db, Role::Admin);
        let b = seed_user(&db, Role::User);
        let call = pending_call(&db, a, b);

        let fetched = db.get_call(call.id).unwrap();
        assert_eq!(fetched.status, CallStatus::Pending);
        assert_eq!(fetched.offer, call.offer);
    }

    #[test]
    fn transition_cas_only_first_wins() {
        let db = Database::open_in_memory().unwrap();
        let a = seed_user(&db, Role::Admin);
        let b = seed_user(&db, Role::User);
        let call = pending_call(&db, a, b);

        let now = Utc::now();
        assert!(db
            .transition_call(call.id, CallStatus::Pending, CallStatus::Accepted, Some(now), None, None)
            .unwrap());

        // A racing reject arrives after the accept: it must lose.
        assert!(!db
            .transition_call(call.id, CallStatus::Pending, CallStatus::Rejected, None, Some(now), Some(0))
            .unwrap());

        let fetched = db.get_call(call.id).unwrap();
        assert_eq!(fetched.status, CallStatus::Accepted);
        assert!(fetched.started_at.is_some());
        assert!(fetched.ended_at.is_none());
    }

    #[test]
    fn accepted_to_ended_keeps_started_at() {
        let db = Database::open_in_memory().unwrap();
        let a = seed_user(&db, Role::Admin);
        let b = seed_user(&db, Role::User);
        let call = pending_call(&db, a, b);

        let started = Utc::now() - chrono::Duration::seconds(30);
        db.transition_call(call.id, CallStatus::Pending, CallStatus::Accepted, Some(started), None, None)
            .unwrap();

        let ended = Utc::now();
        let duration = (ended - started).num_seconds();
        db.transition_call(call.id, CallStatus::Accepted, CallStatus::Ended, None, Some(ended), Some(duration))
            .unwrap();

        let fetched = db.get_call(call.id).unwrap();
        assert_eq!(fetched.status, CallStatus::Ended);
        assert_eq!(fetched.duration_secs, duration);
        // COALESCE must not clobber the accept-time start.
        assert_eq!(
            fetched.started_at.unwrap().timestamp(),
            started.timestamp()
        );
    }

    #[test]
    fn history_queries() {
        let db = Database::open_in_memory().unwrap();
        let a = seed_user(&db, Role::Admin);
        let b = seed_user(&db, Role::User);
        let c = seed_user(&db, Role::User);

        pending_call(&db, a, b);
        pending_call(&db, b, a);
        pending_call(&db, a, c);

        assert_eq!(db.calls_between(a, b).unwrap().len(), 2);
        assert_eq!(db.calls_for_user(a).unwrap().len(), 3);
        assert_eq!(db.calls_for_user(c).unwrap().len(), 1);
    }
}

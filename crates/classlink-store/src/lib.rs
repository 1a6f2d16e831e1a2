//! # classlink-store
//!
//! Durable SQLite storage for the classlink real-time core.  The store
//! exclusively owns `User`, `Message` and `Call` records plus the durable
//! online flag, the favorites set and the bearer-token table.  It exposes a
//! synchronous `Database` handle that wraps a `rusqlite::Connection` and
//! provides typed CRUD helpers for every domain model; the server wraps the
//! handle in an async mutex.
//!
//! The in-memory session registry is deliberately *not* persisted here: it
//! is rebuilt empty on restart, and the `is_online` flag must be treated as
//! stale until a live connection or the presence sweep reconciles it.

pub mod calls;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod tokens;
pub mod users;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;

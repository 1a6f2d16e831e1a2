//! # classlink-shared
//!
//! Types shared between the classlink real-time server and its clients:
//! stable identifiers and roles, the JSON wire protocol spoken over the
//! WebSocket transport, and the error taxonomy surfaced through per-event
//! acknowledgments.

pub mod error;
pub mod protocol;
pub mod types;

pub use error::SignalError;

use thiserror::Error;

/// Error taxonomy for real-time operations.
///
/// `Authentication` aborts the handshake before any room join; all other
/// variants travel back to the client inside the per-event acknowledgment
/// as `{status: "error", message}` and leave server state untouched.
#[derive(Debug, Error)]
pub enum SignalError {
    /// Missing or invalid credential at handshake.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Missing/invalid fields, malformed ids, or unauthorized cross-role
    /// messaging.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Unknown user, call, or message id.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Call operation attempted from the wrong lifecycle state, or the
    /// target is no longer reachable.
    #[error("Conflict: {0}")]
    StateConflict(String),

    /// Durable store or attachment storage failure (including timeouts).
    #[error("Dependency error: {0}")]
    Dependency(String),
}

impl SignalError {
    /// Short machine-readable tag, used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalError::Authentication(_) => "authentication",
            SignalError::Validation(_) => "validation",
            SignalError::NotFound(_) => "not_found",
            SignalError::StateConflict(_) => "state_conflict",
            SignalError::Dependency(_) => "dependency",
        }
    }
}

pub type Result<T> = std::result::Result<T, SignalError>;

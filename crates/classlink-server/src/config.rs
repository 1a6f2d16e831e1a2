//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use classlink_shared::types::MessageKind;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP server (WebSocket + REST).
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.  Empty means the platform data directory.
    /// Env: `DB_PATH`
    pub db_path: Option<PathBuf>,

    /// Filesystem path where attachment blobs are stored.
    /// Env: `ATTACHMENT_PATH`
    /// Default: `./attachments`
    pub attachment_path: PathBuf,

    /// Externally visible base URL used to build attachment links.
    /// Env: `PUBLIC_BASE_URL`
    /// Default: `http://localhost:8080`
    pub public_base_url: String,

    /// Interval of the presence reconcile-and-rebroadcast sweep.
    /// Env: `PRESENCE_INTERVAL_SECS`
    /// Default: 30s
    pub presence_interval: Duration,

    /// Bounded retries for the room-join primitive during registration.
    /// Env: `ROOM_JOIN_ATTEMPTS`
    /// Default: 3
    pub join_attempts: u32,

    /// Base backoff between room-join retries (doubles per attempt).
    /// Env: `ROOM_JOIN_BACKOFF_MS`
    /// Default: 50ms
    pub join_backoff: Duration,

    /// Timeout applied to dependency calls (attachment storage).
    /// Env: `DEPENDENCY_TIMEOUT_MS`
    /// Default: 5s
    pub dependency_timeout: Duration,

    /// Per-kind payload ceilings, enforced before any storage call.
    /// Env: `MAX_TEXT_BYTES`, `MAX_IMAGE_BYTES`, `MAX_AUDIO_BYTES`,
    /// `MAX_DOCUMENT_BYTES`
    pub max_text_bytes: usize,
    pub max_image_bytes: usize,
    pub max_audio_bytes: usize,
    pub max_document_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8080).into(),
            db_path: None,
            attachment_path: PathBuf::from("./attachments"),
            public_base_url: "http://localhost:8080".to_string(),
            presence_interval: Duration::from_secs(30),
            join_attempts: 3,
            join_backoff: Duration::from_millis(50),
            dependency_timeout: Duration::from_secs(5),
            max_text_bytes: 8 * 1024,
            max_image_bytes: 5 * 1024 * 1024,
            max_audio_bytes: 10 * 1024 * 1024,
            max_document_bytes: 20 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Ok(path) = std::env::var("DB_PATH") {
            if !path.is_empty() {
                config.db_path = Some(PathBuf::from(path));
            }
        }

        if let Ok(path) = std::env::var("ATTACHMENT_PATH") {
            config.attachment_path = PathBuf::from(path);
        }

        if let Ok(url) = std::env::var("PUBLIC_BASE_URL") {
            config.public_base_url = url.trim_end_matches('/').to_string();
        }

        if let Some(secs) = parse_env::<u64>("PRESENCE_INTERVAL_SECS") {
            config.presence_interval = Duration::from_secs(secs.max(1));
        }

        if let Some(n) = parse_env::<u32>("ROOM_JOIN_ATTEMPTS") {
            config.join_attempts = n.max(1);
        }

        if let Some(ms) = parse_env::<u64>("ROOM_JOIN_BACKOFF_MS") {
            config.join_backoff = Duration::from_millis(ms);
        }

        if let Some(ms) = parse_env::<u64>("DEPENDENCY_TIMEOUT_MS") {
            config.dependency_timeout = Duration::from_millis(ms.max(1));
        }

        if let Some(n) = parse_env::<usize>("MAX_TEXT_BYTES") {
            config.max_text_bytes = n;
        }
        if let Some(n) = parse_env::<usize>("MAX_IMAGE_BYTES") {
            config.max_image_bytes = n;
        }
        if let Some(n) = parse_env::<usize>("MAX_AUDIO_BYTES") {
            config.max_audio_bytes = n;
        }
        if let Some(n) = parse_env::<usize>("MAX_DOCUMENT_BYTES") {
            config.max_document_bytes = n;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }

    /// Size ceiling for a message payload of the given kind.
    pub fn limit_for(&self, kind: MessageKind) -> usize {
        match kind {
            MessageKind::Text => self.max_text_bytes,
            MessageKind::Image => self.max_image_bytes,
            MessageKind::Audio => self.max_audio_bytes,
            MessageKind::Document => self.max_document_bytes,
        }
    }

    /// The largest per-kind ceiling; used as the blob store's hard cap.
    pub fn max_attachment_bytes(&self) -> usize {
        self.max_image_bytes
            .max(self.max_audio_bytes)
            .max(self.max_document_bytes)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Invalid value, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.join_attempts, 3);
        assert!(config.db_path.is_none());
    }

    #[test]
    fn test_limit_for_kind() {
        let config = ServerConfig::default();
        assert_eq!(config.limit_for(MessageKind::Text), 8 * 1024);
        assert_eq!(config.limit_for(MessageKind::Image), 5 * 1024 * 1024);
        assert!(config.max_attachment_bytes() >= config.limit_for(MessageKind::Document));
    }
}

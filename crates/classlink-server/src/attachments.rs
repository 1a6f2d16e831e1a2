//! Disk-backed attachment storage.
//!
//! Inline-encoded message payloads are decoded, written under a UUID name
//! and replaced by a durable URL before the message record is persisted.
//! The store never interprets blob contents; metadata capture happens in
//! the pipeline.

use std::path::{Path, PathBuf};

use base64::Engine;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use classlink_shared::error::Result;
use classlink_shared::SignalError;

/// Verify that a resolved path stays within the expected base directory.
/// Prevents path traversal attacks.
fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf> {
    let canonical_base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
    let mut resolved = canonical_base.clone();
    for component in target
        .strip_prefix(&canonical_base)
        .unwrap_or(target)
        .components()
    {
        match component {
            std::path::Component::Normal(c) => resolved.push(c),
            std::path::Component::ParentDir => {
                return Err(SignalError::Validation("Path traversal detected".to_string()));
            }
            _ => {} // RootDir, CurDir, Prefix -- skip
        }
    }
    if !resolved.starts_with(&canonical_base) {
        return Err(SignalError::Validation("Path traversal detected".to_string()));
    }
    Ok(resolved)
}

/// An inline `data:` payload split into its parts.
pub struct InlineBlob {
    pub bytes: Vec<u8>,
    pub mime: Option<String>,
}

/// Decode an inline-encoded payload (`data:<mime>;base64,<data>`).
/// Returns `None` when the content is not a data URL.
pub fn decode_inline(content: &str) -> Option<std::result::Result<InlineBlob, SignalError>> {
    let rest = content.strip_prefix("data:")?;
    let (header, data) = rest.split_once(',')?;

    if !header.ends_with(";base64") {
        return Some(Err(SignalError::Validation(
            "Inline payloads must be base64-encoded".to_string(),
        )));
    }

    let mime = header.trim_end_matches(";base64");
    let mime = if mime.is_empty() {
        None
    } else {
        Some(mime.to_string())
    };

    Some(
        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map(|bytes| InlineBlob { bytes, mime })
            .map_err(|e| SignalError::Validation(format!("Invalid base64 payload: {e}"))),
    )
}

#[derive(Debug, Clone)]
pub struct AttachmentStore {
    base_path: PathBuf,
    max_size: usize,
    public_base_url: String,
}

impl AttachmentStore {
    pub async fn new(
        base_path: PathBuf,
        max_size: usize,
        public_base_url: String,
    ) -> Result<Self> {
        fs::create_dir_all(&base_path).await.map_err(|e| {
            SignalError::Dependency(format!(
                "Failed to create attachment directory '{}': {}",
                base_path.display(),
                e
            ))
        })?;

        info!(path = %base_path.display(), "Attachment store initialized");

        Ok(Self {
            base_path,
            max_size,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Write a blob and return its durable URL.
    pub async fn store_blob(&self, data: &[u8]) -> Result<String> {
        if data.is_empty() {
            return Err(SignalError::Validation("Empty attachment".to_string()));
        }
        if data.len() > self.max_size {
            return Err(SignalError::Validation(format!(
                "Attachment too large: {} bytes (max {})",
                data.len(),
                self.max_size
            )));
        }

        let id = Uuid::new_v4();
        let path = self.safe_blob_path(&id)?;

        fs::write(&path, data).await.map_err(|e| {
            SignalError::Dependency(format!("Failed to write attachment {id}: {e}"))
        })?;

        debug!(id = %id, size = data.len(), "Stored attachment");
        Ok(format!("{}/attachments/{}", self.public_base_url, id))
    }

    /// Read a blob back by id.
    pub async fn get_blob(&self, id: Uuid) -> Result<Vec<u8>> {
        let path = self.safe_blob_path(&id)?;

        if !path.exists() {
            return Err(SignalError::NotFound(format!("attachment {id}")));
        }

        let data = fs::read(&path).await.map_err(|e| {
            SignalError::Dependency(format!("Failed to read attachment {id}: {e}"))
        })?;

        debug!(id = %id, size = data.len(), "Retrieved attachment");
        Ok(data)
    }

    /// Safe blob path that validates against traversal.
    fn safe_blob_path(&self, id: &Uuid) -> Result<PathBuf> {
        let raw = self.base_path.join(id.to_string());
        ensure_within(&self.base_path, &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_store() -> (AttachmentStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = AttachmentStore::new(
            dir.path().to_path_buf(),
            1024,
            "http://localhost:8080".to_string(),
        )
        .await
        .unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_store_and_get() {
        let (store, _dir) = test_store().await;
        let data = b"attachment-bytes";

        let url = store.store_blob(data).await.unwrap();
        let id: Uuid = url.rsplit('/').next().unwrap().parse().unwrap();

        assert!(url.starts_with("http://localhost:8080/attachments/"));
        assert_eq!(store.get_blob(id).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_size_cap() {
        let (store, _dir) = test_store().await;
        let oversized = vec![0u8; 2048];
        assert!(store.store_blob(&oversized).await.is_err());
    }

    #[tokio::test]
    async fn test_empty_blob_rejected() {
        let (store, _dir) = test_store().await;
        assert!(store.store_blob(b"").await.is_err());
    }

    #[tokio::test]
    async fn test_missing_blob_not_found() {
        let (store, _dir) = test_store().await;
        assert!(store.get_blob(Uuid::new_v4()).await.is_err());
    }

    #[test]
    fn test_decode_inline() {
        let blob = decode_inline("data:image/png;base64,aGVsbG8=")
            .unwrap()
            .unwrap();
        assert_eq!(blob.bytes, b"hello");
        assert_eq!(blob.mime.as_deref(), Some("image/png"));

        // Plain text is not an inline payload.
        assert!(decode_inline("just a chat message").is_none());

        // Data URLs that are not base64 are rejected, not ignored.
        assert!(decode_inline("data:text/plain,hi").unwrap().is_err());

        // Corrupt base64 is a validation error.
        assert!(decode_inline("data:image/png;base64,!!!").unwrap().is_err());
    }
}

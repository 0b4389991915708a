/// Attachment storage for reviewer submissions
///
/// Files travel with a submission and are uploaded before its conclusion is
/// stored. When the submission later fails, the review service deletes what
/// was uploaded.

use crate::workflow::types::{Attachment, WorkflowId};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Reference to an uploaded file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredAttachment {
    pub key: String,
    pub filename: String,
    /// Backend-specific location (a file path for the local store)
    pub location: String,
}

#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn upload(
        &self,
        workflow_type: &str,
        workflow_id: WorkflowId,
        attachment: &Attachment,
    ) -> Result<StoredAttachment>;

    async fn delete(&self, stored: &StoredAttachment) -> Result<()>;
}

/// Stores files under `<root>/<workflow_type>/<workflow_id>/`
#[derive(Debug, Clone)]
pub struct LocalAttachmentStore {
    root: PathBuf,
}

impl LocalAttachmentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Keep only the final path component so uploads cannot escape their directory
fn sanitize_filename(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next()?.trim();
    if base.is_empty() || base == "." || base == ".." {
        None
    } else {
        Some(base.to_string())
    }
}

#[async_trait]
impl AttachmentStore for LocalAttachmentStore {
    async fn upload(
        &self,
        workflow_type: &str,
        workflow_id: WorkflowId,
        attachment: &Attachment,
    ) -> Result<StoredAttachment> {
        let filename = sanitize_filename(&attachment.filename)
            .ok_or_else(|| anyhow::anyhow!("invalid attachment filename '{}'", attachment.filename))?;
        let workflow_dir = sanitize_filename(workflow_type)
            .ok_or_else(|| anyhow::anyhow!("invalid workflow type '{}'", workflow_type))?;

        let dir = self.root.join(workflow_dir).join(workflow_id.to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create attachment directory '{}'", dir.display()))?;

        let path = dir.join(format!("{}-{}", uuid::Uuid::new_v4(), filename));
        tokio::fs::write(&path, &attachment.content)
            .await
            .with_context(|| format!("Failed to write attachment '{}'", path.display()))?;

        tracing::debug!("📎 Stored attachment '{}' at {}", attachment.key, path.display());

        Ok(StoredAttachment {
            key: attachment.key.clone(),
            filename,
            location: path.to_string_lossy().into_owned(),
        })
    }

    async fn delete(&self, stored: &StoredAttachment) -> Result<()> {
        match tokio::fs::remove_file(&stored.location).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete attachment '{}'", stored.location)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filenames_are_reduced_to_their_last_component() {
        assert_eq!(sanitize_filename("../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(sanitize_filename("C:\\docs\\quote.pdf").as_deref(), Some("quote.pdf"));
        assert_eq!(sanitize_filename(".."), None);
        assert_eq!(sanitize_filename("dir/"), None);
    }

    #[tokio::test]
    async fn upload_then_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalAttachmentStore::new(dir.path());
        let stored = store
            .upload(
                "purchase",
                3,
                &Attachment {
                    key: "quote".to_string(),
                    filename: "quote.pdf".to_string(),
                    content: b"%PDF".to_vec(),
                },
            )
            .await
            .unwrap();
        assert!(stored.location.contains("purchase"));
        assert_eq!(tokio::fs::read(&stored.location).await.unwrap(), b"%PDF");

        store.delete(&stored).await.unwrap();
        assert!(!Path::new(&stored.location).exists());
        // deleting twice is fine
        store.delete(&stored).await.unwrap();
    }
}

//! Encrypted, content-addressed persistence of message bodies and attachments

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{AttachmentMeta, CanonicalMessage, EmailAddress, ProjectId, UserId};
use crate::storage::{BlobStore, attachment_key, content_key};

/// The JSON document stored for each message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEmail {
    pub message_id: String,
    pub thread_id: String,
    pub subject: String,
    pub from: EmailAddress,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub sent_at: DateTime<Utc>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub snippet: String,
    pub label_ids: Vec<String>,
    pub attachments: Vec<StoredAttachment>,
    pub stored_at: DateTime<Utc>,
}

/// Attachment entry of a [`StoredEmail`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredAttachment {
    #[serde(flatten)]
    pub meta: AttachmentMeta,
    /// Blob key of the bytes, when the provider embedded them
    pub path: Option<String>,
}

/// Result of [`ContentStore::store_email`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreOutcome {
    pub content_path: Option<String>,
    pub attachment_paths: Vec<String>,
    /// Plaintext bytes written across all blobs
    pub total_size: u64,
    pub success: bool,
    pub error: Option<String>,
}

impl StoreOutcome {
    fn failed(error: String) -> Self {
        Self {
            success: false,
            error: Some(error),
            ..Default::default()
        }
    }
}

/// Writes message content to a [`BlobStore`] under deterministic keys
///
/// Storing the same message twice overwrites the same objects, so a retried
/// store is harmless.
pub struct ContentStore {
    blobs: Arc<dyn BlobStore>,
}

impl ContentStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    /// Store a message's content document and attachments
    ///
    /// Any failure aborts the remaining writes and is reported in the
    /// outcome; blobs written before the failure are left in place.
    pub fn store_email(
        &self,
        owner_id: &UserId,
        project_id: &ProjectId,
        message: &CanonicalMessage,
    ) -> StoreOutcome {
        match self.try_store(owner_id, project_id, message) {
            Ok(outcome) => {
                log::info!(
                    "[CONTENT] Stored message {} ({} attachments, {} bytes)",
                    message.id,
                    outcome.attachment_paths.len(),
                    outcome.total_size
                );
                outcome
            }
            Err(e) => {
                log::error!("[CONTENT] Failed to store message {}: {:#}", message.id, e);
                StoreOutcome::failed(format!("{:#}", e))
            }
        }
    }

    fn try_store(
        &self,
        owner_id: &UserId,
        project_id: &ProjectId,
        message: &CanonicalMessage,
    ) -> Result<StoreOutcome> {
        let owner = owner_id.as_str();
        let project = project_id.as_str();
        let id = message.id.as_str();

        let mut attachments = Vec::with_capacity(message.attachments.len());
        let mut attachment_paths = Vec::new();
        let mut total_size = 0u64;

        for (index, attachment) in message.attachments.iter().enumerate() {
            let path = match &attachment.data {
                Some(bytes) => {
                    let key = attachment_key(
                        message.sent_at,
                        owner,
                        project,
                        id,
                        index,
                        &attachment.filename,
                    );
                    self.blobs
                        .put(&key, bytes)
                        .with_context(|| format!("Failed to store attachment {}", key))?;
                    total_size += bytes.len() as u64;
                    attachment_paths.push(key.clone());
                    Some(key)
                }
                None => None,
            };
            attachments.push(StoredAttachment {
                meta: attachment.clone(),
                path,
            });
        }

        let document = StoredEmail {
            message_id: id.to_string(),
            thread_id: message.thread_id.clone(),
            subject: message.subject.clone(),
            from: message.from.clone(),
            to: message.to.clone(),
            cc: message.cc.clone(),
            sent_at: message.sent_at,
            body_text: message.body_text.clone(),
            body_html: message.body_html.clone(),
            snippet: message.snippet.clone(),
            label_ids: message.label_ids.clone(),
            attachments,
            stored_at: Utc::now(),
        };

        let json = serde_json::to_vec(&document).context("Failed to encode content")?;
        let content_path = content_key(message.sent_at, owner, project, id);
        self.blobs
            .put(&content_path, &json)
            .with_context(|| format!("Failed to store content {}", content_path))?;
        total_size += json.len() as u64;

        Ok(StoreOutcome {
            content_path: Some(content_path),
            attachment_paths,
            total_size,
            success: true,
            error: None,
        })
    }

    /// Load a stored content document; failures are logged and yield `None`
    pub fn retrieve_email(&self, content_path: &str) -> Option<StoredEmail> {
        let loaded = self.blobs.get(content_path).and_then(|bytes| {
            bytes
                .map(|b| serde_json::from_slice::<StoredEmail>(&b))
                .transpose()
                .map_err(anyhow::Error::from)
        });

        match loaded {
            Ok(Some(email)) => Some(email),
            Ok(None) => {
                log::debug!("[CONTENT] No content at {}", content_path);
                None
            }
            Err(e) => {
                log::warn!("[CONTENT] Failed to read {}: {:#}", content_path, e);
                None
            }
        }
    }

    /// Delete a message's content and attachments
    ///
    /// Every path is attempted; returns false if any deletion failed.
    pub fn delete_email(&self, content_path: &str, attachment_paths: &[String]) -> bool {
        let mut ok = true;
        for path in std::iter::once(content_path).chain(attachment_paths.iter().map(String::as_str))
        {
            if let Err(e) = self.blobs.delete(path) {
                log::warn!("[CONTENT] Failed to delete {}: {:#}", path, e);
                ok = false;
            }
        }
        ok
    }
}

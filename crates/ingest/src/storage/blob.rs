//! Blob storage for email content and attachments
//!
//! Blobs are addressed by slash-separated string keys. Keys for ingested
//! mail are deterministic, so storing the same message twice writes the
//! same objects.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use chrono::{DateTime, Utc};

/// Trait for blob storage operations
///
/// Implementations handle compression and encryption internally.
pub trait BlobStore: Send + Sync {
    /// Store blob content, replacing any existing blob under the key
    fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Retrieve blob content
    ///
    /// Returns None if the blob doesn't exist.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Check if a blob exists
    fn exists(&self, key: &str) -> Result<bool>;

    /// Delete a blob; deleting a missing blob is not an error
    fn delete(&self, key: &str) -> Result<()>;
}

/// Make an identifier safe to use as one key segment
fn key_segment(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Sanitize an attachment filename for use in a key
pub fn sanitize_filename(name: &str) -> String {
    let cleaned = key_segment(name.trim());
    if cleaned == "_" {
        "attachment".to_string()
    } else {
        cleaned
    }
}

fn message_prefix(
    sent_at: DateTime<Utc>,
    owner_id: &str,
    project_id: &str,
    message_id: &str,
) -> String {
    format!(
        "emails/{}/{}/{}/{}",
        sent_at.format("%Y/%m/%d"),
        key_segment(owner_id),
        key_segment(project_id),
        key_segment(message_id)
    )
}

/// Key of the content document of a message
///
/// `emails/{yyyy}/{mm}/{dd}/{owner}/{project}/{message}/content.json`, dated
/// by the message's send time in UTC.
pub fn content_key(
    sent_at: DateTime<Utc>,
    owner_id: &str,
    project_id: &str,
    message_id: &str,
) -> String {
    format!(
        "{}/content.json",
        message_prefix(sent_at, owner_id, project_id, message_id)
    )
}

/// Key of the `index`-th attachment of a message
pub fn attachment_key(
    sent_at: DateTime<Utc>,
    owner_id: &str,
    project_id: &str,
    message_id: &str,
    index: usize,
    filename: &str,
) -> String {
    format!(
        "{}/attachments/{}_{}",
        message_prefix(sent_at, owner_id, project_id, message_id),
        index,
        sanitize_filename(filename)
    )
}

/// In-memory blob store for tests and dry runs
#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs
    pub fn len(&self) -> usize {
        self.blobs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.blobs.read().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl BlobStore for InMemoryBlobStore {
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.blobs
            .write()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().unwrap().get(key).cloned())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.blobs.read().unwrap().contains_key(key))
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.blobs.write().unwrap().remove(key);
        Ok(())
    }
}

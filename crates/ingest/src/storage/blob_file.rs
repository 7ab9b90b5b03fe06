//! File-based blob storage with zstd compression and optional encryption

use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};

use super::blob::BlobStore;
use super::cipher::BlobCipher;

/// File-based blob storage
///
/// Keys map one-to-one onto relative paths under the root:
/// ```text
/// content/
///   emails/2025/03/07/u1/p1/18c2f/
///     content.json                # zstd, then AES-256-GCM
///     attachments/0_plan.pdf
/// ```
pub struct FileBlobStore {
    root: PathBuf,
    compression_level: i32,
    cipher: Option<BlobCipher>,
}

impl FileBlobStore {
    /// Create a new file blob store at the given path
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).context("Failed to create blob storage directory")?;
        Ok(Self {
            root,
            compression_level: 3, // Good balance of speed vs compression
            cipher: None,
        })
    }

    /// Encrypt blobs at rest with the given cipher
    pub fn with_cipher(mut self, cipher: BlobCipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Get the file path for a blob key, rejecting keys that escape the root
    fn blob_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if key.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("Invalid blob key: {:?}", key);
        }
        Ok(self.root.join(relative))
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let compressed =
            zstd::encode_all(data, self.compression_level).context("Failed to compress blob")?;
        match &self.cipher {
            Some(cipher) => Ok(cipher.encrypt(&compressed)?),
            None => Ok(compressed),
        }
    }

    fn decode(&self, stored: Vec<u8>) -> Result<Vec<u8>> {
        let compressed = match &self.cipher {
            Some(cipher) => cipher.decrypt(&stored)?,
            None => stored,
        };

        let mut decoder = zstd::Decoder::new(compressed.as_slice())?;
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .context("Failed to decompress blob")?;
        Ok(decompressed)
    }
}

impl BlobStore for FileBlobStore {
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.blob_path(key)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let encoded = self.encode(data)?;

        // Write atomically (write to temp, then rename)
        let mut temp_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        temp_name.push(".tmp");
        let temp_path = path.with_file_name(temp_name);
        fs::write(&temp_path, &encoded)?;
        fs::rename(&temp_path, &path)?;

        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.blob_path(key)?;

        if !path.exists() {
            return Ok(None);
        }

        let stored = fs::read(&path)?;
        self.decode(stored)
            .with_context(|| format!("Failed to decode blob {}", key))
            .map(Some)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.blob_path(key)?.exists())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.blob_path(key)?;
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const KEY: &str = "emails/2025/03/07/u1/p1/m1/content.json";

    fn encrypted_store(root: &Path) -> FileBlobStore {
        FileBlobStore::new(root)
            .unwrap()
            .with_cipher(BlobCipher::from_key_bytes(&[9u8; 32]).unwrap())
    }

    #[test]
    fn test_put_get() {
        let dir = tempdir().unwrap();
        let store = FileBlobStore::new(dir.path().join("content")).unwrap();

        store.put(KEY, b"{\"subject\":\"Framing\"}").unwrap();
        let retrieved = store.get(KEY).unwrap().unwrap();
        assert_eq!(retrieved, b"{\"subject\":\"Framing\"}");
        assert!(dir.path().join("content").join(KEY).exists());
    }

    #[test]
    fn test_get_nonexistent() {
        let dir = tempdir().unwrap();
        let store = FileBlobStore::new(dir.path()).unwrap();
        assert!(store.get("emails/missing/content.json").unwrap().is_none());
        assert!(!store.exists("emails/missing/content.json").unwrap());
    }

    #[test]
    fn test_encrypted_at_rest() {
        let dir = tempdir().unwrap();
        let store = encrypted_store(dir.path());
        let data = "Hello, world! ".repeat(1000);

        store.put(KEY, data.as_bytes()).unwrap();

        let on_disk = fs::read(dir.path().join(KEY)).unwrap();
        assert!(on_disk.len() < data.len());
        // Plain zstd frames start with the magic number; encrypted ones must not
        assert!(zstd::decode_all(on_disk.as_slice()).is_err());

        assert_eq!(store.get(KEY).unwrap().unwrap(), data.as_bytes());
    }

    #[test]
    fn test_wrong_key_cannot_read() {
        let dir = tempdir().unwrap();
        encrypted_store(dir.path()).put(KEY, b"secret").unwrap();

        let other = FileBlobStore::new(dir.path())
            .unwrap()
            .with_cipher(BlobCipher::from_key_bytes(&[1u8; 32]).unwrap());
        assert!(other.get(KEY).is_err());
    }

    #[test]
    fn test_rejects_escaping_keys() {
        let dir = tempdir().unwrap();
        let store = FileBlobStore::new(dir.path().join("content")).unwrap();

        assert!(store.put("../outside", b"x").is_err());
        assert!(store.put("emails/../../outside", b"x").is_err());
        assert!(store.put("/etc/passwd", b"x").is_err());
        assert!(store.put("", b"x").is_err());
        assert!(!dir.path().join("outside").exists());
    }

    #[test]
    fn test_delete() {
        let dir = tempdir().unwrap();
        let store = encrypted_store(dir.path());

        store.put(KEY, b"data").unwrap();
        assert!(store.exists(KEY).unwrap());

        store.delete(KEY).unwrap();
        assert!(!store.exists(KEY).unwrap());
        store.delete(KEY).unwrap();
    }
}

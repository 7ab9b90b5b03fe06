//! Service wiring for the Foreman operator binary

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use ingest::{
    AccessGrantManager, BlobCipher, ChangeSynchronizer, ContentStore, Datastore, FileBlobStore,
    GmailAuth, GmailConnector, GmailCredentials, IdentityFilter, IngestSettings, SqliteDatastore,
};
use log::{debug, warn};

/// Database filename under the data directory
const DB_FILE: &str = "foreman.db";

/// Blob root under the data directory
const CONTENT_DIR: &str = "content";

/// Long-lived services built once at startup
pub struct ForemanApp {
    pub settings: IngestSettings,
    pub store: Arc<dyn Datastore>,
    pub grants: Arc<AccessGrantManager>,
    data_dir: PathBuf,
}

impl ForemanApp {
    /// Load settings and open the datastore
    pub fn open() -> Result<Self> {
        let settings = IngestSettings::load()?;
        let data_dir = settings.data_dir()?;
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;

        let db_path = data_dir.join(DB_FILE);
        debug!("Opening database at {:?}", db_path);
        let store: Arc<dyn Datastore> = Arc::new(SqliteDatastore::new(&db_path)?);
        let grants = Arc::new(AccessGrantManager::new(
            store.clone(),
            settings.max_grant_age_days,
        ));

        Ok(Self {
            settings,
            store,
            grants,
            data_dir,
        })
    }

    /// OAuth client for consent and token refresh
    pub fn gmail_auth(&self) -> Result<GmailAuth> {
        match GmailCredentials::load() {
            Ok(creds) => Ok(GmailAuth::from_credentials(&creds)),
            Err(e) => {
                if let Some(path) = GmailCredentials::default_credentials_path() {
                    warn!(
                        "To configure Gmail access, either:\n\
                         1. Place your Google OAuth credentials at: {}\n\
                         2. Or set environment variables: GMAIL_CLIENT_ID and GMAIL_CLIENT_SECRET",
                        path.display()
                    );
                }
                Err(e)
            }
        }
    }

    /// Build the synchronizer with encrypted content storage
    pub fn synchronizer(&self) -> Result<ChangeSynchronizer> {
        let key = self.settings.content_key_bytes()?;
        let cipher = BlobCipher::from_key_bytes(&key)?;
        let blobs = FileBlobStore::new(self.data_dir.join(CONTENT_DIR))?.with_cipher(cipher);

        Ok(ChangeSynchronizer::new(
            self.store.clone(),
            self.grants.clone(),
            IdentityFilter::new(self.store.clone()),
            ContentStore::new(Arc::new(blobs)),
            Arc::new(GmailConnector::new(self.gmail_auth()?)),
            &self.settings,
        ))
    }
}

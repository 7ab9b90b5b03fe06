//! Configuration loading for the ingestion pipeline
//!
//! OAuth client credentials are loaded from (in order of priority):
//! 1. Compile-time embedded credentials (for production builds)
//! 2. JSON file (Google Cloud Console format)
//! 3. Runtime environment variables (fallback)
//!
//! Pipeline settings come from `ingest.json` in the config directory, with
//! environment overrides for deployment secrets.

use anyhow::{Context, Result};
use base64::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Credentials filename in the Foreman config directory
const CREDENTIALS_FILE: &str = "google-credentials.json";

/// Settings filename in the Foreman config directory
const SETTINGS_FILE: &str = "ingest.json";

const ENV_DATA_DIR: &str = "FOREMAN_DATA_DIR";
const ENV_CONTENT_KEY: &str = "FOREMAN_CONTENT_KEY";
const ENV_VERIFICATION_TOKEN: &str = "FOREMAN_VERIFICATION_TOKEN";

/// OAuth credentials for Gmail API access
#[derive(Debug, Clone)]
pub struct GmailCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Google Cloud Console credential file format
#[derive(Deserialize)]
struct GoogleCredentialFile {
    installed: Option<InstalledCredentials>,
    web: Option<InstalledCredentials>,
}

#[derive(Deserialize)]
struct InstalledCredentials {
    client_id: String,
    client_secret: String,
}

impl GmailCredentials {
    /// Load credentials using the following priority:
    /// 1. Compile-time embedded credentials
    /// 2. JSON file (~/.config/foreman/google-credentials.json)
    /// 3. Runtime environment variables
    pub fn load() -> Result<Self> {
        if let Some(creds) = Self::from_compile_time() {
            return Ok(creds);
        }

        if config::config_exists(CREDENTIALS_FILE) {
            let creds: GoogleCredentialFile = config::load_json(CREDENTIALS_FILE)?;
            return Self::from_credential_file(creds);
        }

        Self::from_env()
    }

    /// Load credentials embedded at compile time via environment variables.
    /// Build with: GOOGLE_CLIENT_ID=xxx GOOGLE_CLIENT_SECRET=yyy cargo build --release
    pub fn from_compile_time() -> Option<Self> {
        let client_id = option_env!("GOOGLE_CLIENT_ID")?;
        let client_secret = option_env!("GOOGLE_CLIENT_SECRET")?;

        if client_id.is_empty() || client_secret.is_empty() {
            return None;
        }

        Some(Self {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        })
    }

    /// Load credentials from a specific JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let creds: GoogleCredentialFile = config::load_json_file(path)?;
        Self::from_credential_file(creds)
    }

    fn from_credential_file(creds: GoogleCredentialFile) -> Result<Self> {
        // Support both "installed" (desktop) and "web" credential types
        let installed = creds
            .installed
            .or(creds.web)
            .context("Credentials file missing 'installed' or 'web' section")?;

        Ok(Self {
            client_id: installed.client_id,
            client_secret: installed.client_secret,
        })
    }

    /// Parse credentials from JSON string (Google Cloud Console format)
    pub fn from_json(json: &str) -> Result<Self> {
        let creds: GoogleCredentialFile =
            serde_json::from_str(json).context("Failed to parse credentials JSON")?;
        Self::from_credential_file(creds)
    }

    /// Load credentials from environment variables
    pub fn from_env() -> Result<Self> {
        let client_id = std::env::var("GMAIL_CLIENT_ID")
            .context("GMAIL_CLIENT_ID environment variable not set")?;
        let client_secret = std::env::var("GMAIL_CLIENT_SECRET")
            .context("GMAIL_CLIENT_SECRET environment variable not set")?;

        Ok(Self {
            client_id,
            client_secret,
        })
    }

    /// Get the default credentials file path (~/.config/foreman/google-credentials.json)
    pub fn default_credentials_path() -> Option<PathBuf> {
        config::config_path(CREDENTIALS_FILE)
    }
}

/// Tunables for the ingestion pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    /// Root for the database and content blobs; defaults to the platform data dir
    pub data_dir: Option<PathBuf>,
    /// Messages fetched concurrently per chunk
    pub batch_size: usize,
    /// Pause between fetch chunks, for provider rate limits
    pub batch_delay_ms: u64,
    /// Grants older than this require the user to consent again
    pub max_grant_age_days: i64,
    /// Base64-encoded 32-byte AES key for content at rest
    pub content_key: Option<String>,
    /// Token that subscription verification requests must present
    pub verification_token: Option<String>,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            batch_size: 10,
            batch_delay_ms: 100,
            max_grant_age_days: 90,
            content_key: None,
            verification_token: None,
        }
    }
}

impl IngestSettings {
    /// Load settings from the config directory (if present) and apply
    /// environment overrides
    pub fn load() -> Result<Self> {
        let settings = if config::config_exists(SETTINGS_FILE) {
            config::load_json(SETTINGS_FILE)?
        } else {
            Self::default()
        };
        Ok(settings.with_env_overrides())
    }

    /// Parse settings from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse ingest settings")
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(dir) = std::env::var(ENV_DATA_DIR) {
            self.data_dir = Some(PathBuf::from(dir));
        }
        if let Ok(key) = std::env::var(ENV_CONTENT_KEY) {
            self.content_key = Some(key);
        }
        if let Ok(token) = std::env::var(ENV_VERIFICATION_TOKEN) {
            self.verification_token = Some(token);
        }
        self
    }

    /// Resolved data directory
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => config::data_dir().context("Could not determine data directory"),
        }
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    /// Decode the content encryption key
    pub fn content_key_bytes(&self) -> Result<[u8; 32]> {
        let encoded = self.content_key.as_deref().with_context(|| {
            format!(
                "No content key configured; set {} to a base64 32-byte key",
                ENV_CONTENT_KEY
            )
        })?;
        let decoded = BASE64_STANDARD
            .decode(encoded.trim())
            .context("Content key is not valid base64")?;
        decoded
            .try_into()
            .map_err(|v: Vec<u8>| anyhow::anyhow!("Content key must be 32 bytes, got {}", v.len()))
    }
}

//! Gmail API HTTP client
//!
//! Provides methods for fetching messages, history and profile from the
//! Gmail API on behalf of one delegated grant.
//! Uses synchronous HTTP (ureq) to be executor-agnostic.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use serde::de::DeserializeOwned;
use std::sync::{Arc, Mutex};

use super::GmailAuth;
use super::api::{GmailMessage, HistoryResponse, ProfileResponse};
use crate::fetcher::{MailboxApi, MailboxConnector};
use crate::models::{HistoryCursor, MessageId, TokenSet};

/// Error indicating the history ID has expired
#[derive(Debug, thiserror::Error)]
#[error("History ID expired or invalid")]
pub struct HistoryExpiredError;

/// Error indicating the provider rejected the grant's credentials
#[derive(Debug, thiserror::Error)]
#[error("Gmail rejected the credentials (HTTP {status})")]
pub struct UnauthorizedError {
    pub status: u16,
}

/// Error indicating the provider throttled the request
#[derive(Debug, thiserror::Error)]
#[error("Gmail rate limit exceeded")]
pub struct RateLimitedError;

/// Gmail API client bound to one token set
///
/// Access tokens are refreshed transparently when they are about to expire.
/// A refreshed token set is kept until the caller collects it with
/// [`MailboxApi::take_rotated_tokens`] so it can be persisted.
pub struct GmailClient {
    auth: GmailAuth,
    tokens: Mutex<TokenSet>,
    rotated: Mutex<Option<TokenSet>>,
}

impl GmailClient {
    /// Gmail API base URL
    const BASE_URL: &'static str = "https://gmail.googleapis.com/gmail/v1";

    /// Refresh this long before the provider-reported expiry
    const REFRESH_SKEW_SECS: i64 = 300;

    /// Create a new Gmail client
    pub fn new(auth: GmailAuth, tokens: TokenSet) -> Self {
        Self {
            auth,
            tokens: Mutex::new(tokens),
            rotated: Mutex::new(None),
        }
    }

    /// Return a usable access token and whether it was just refreshed
    fn ensure_access_token(&self) -> Result<(String, bool)> {
        let mut tokens = self.tokens.lock().unwrap();

        let skew = Duration::seconds(Self::REFRESH_SKEW_SECS);
        if !tokens.expires_within(Utc::now(), skew) {
            return Ok((tokens.access_token.clone(), false));
        }

        let Some(refresh_token) = tokens.refresh_token.clone() else {
            if tokens.expires_within(Utc::now(), Duration::zero()) {
                anyhow::bail!("Access token expired and no refresh token is available");
            }
            return Ok((tokens.access_token.clone(), false));
        };

        let fresh = self.auth.refresh(&refresh_token)?;
        log::info!("[FETCH] Access token refreshed");
        *tokens = fresh.clone();
        *self.rotated.lock().unwrap() = Some(fresh);

        Ok((tokens.access_token.clone(), true))
    }

    /// GET a JSON resource with bearer auth
    fn get_json<T: DeserializeOwned>(&self, url: &str, what: &str) -> Result<T> {
        let (access_token, _) = self.ensure_access_token()?;

        let response = ureq::get(url)
            .header("Authorization", &format!("Bearer {}", access_token))
            .call();

        match response {
            Ok(mut resp) => resp
                .body_mut()
                .read_json()
                .with_context(|| format!("Failed to parse {} response", what)),
            Err(ureq::Error::StatusCode(status @ (401 | 403))) => {
                Err(UnauthorizedError { status }.into())
            }
            Err(ureq::Error::StatusCode(429)) => Err(RateLimitedError.into()),
            Err(e) => Err(anyhow::anyhow!("Failed to fetch {}: {}", what, e)),
        }
    }
}

impl MailboxApi for GmailClient {
    fn get_message(&self, id: &MessageId) -> Result<GmailMessage> {
        let url = format!(
            "{}/users/me/messages/{}?format=full",
            Self::BASE_URL,
            urlencoding::encode(id.as_str())
        );
        self.get_json(&url, "message")
    }

    /// List history since a given cursor
    ///
    /// # Errors
    /// Returns `HistoryExpiredError` if the cursor is too old (404 from Gmail)
    /// and `UnauthorizedError` if the credentials are rejected
    fn list_history(
        &self,
        start: &HistoryCursor,
        page_token: Option<&str>,
    ) -> Result<HistoryResponse> {
        let (access_token, _) = self.ensure_access_token()?;

        let mut url = format!(
            "{}/users/me/history?startHistoryId={}&historyTypes=messageAdded",
            Self::BASE_URL,
            urlencoding::encode(start.as_str())
        );

        if let Some(token) = page_token {
            url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
        }

        let response = ureq::get(&url)
            .header("Authorization", &format!("Bearer {}", access_token))
            .call();

        match response {
            Ok(mut resp) => {
                let history: HistoryResponse = resp
                    .body_mut()
                    .read_json()
                    .context("Failed to parse history response")?;
                Ok(history)
            }
            Err(ureq::Error::StatusCode(404)) => Err(HistoryExpiredError.into()),
            Err(ureq::Error::StatusCode(status @ (401 | 403))) => {
                Err(UnauthorizedError { status }.into())
            }
            Err(ureq::Error::StatusCode(429)) => Err(RateLimitedError.into()),
            Err(e) => Err(anyhow::anyhow!("Failed to fetch history: {}", e)),
        }
    }

    fn get_profile(&self) -> Result<ProfileResponse> {
        let url = format!("{}/users/me/profile", Self::BASE_URL);
        self.get_json(&url, "profile")
    }

    fn refresh_if_needed(&self) -> Result<Option<TokenSet>> {
        let (_, refreshed) = self.ensure_access_token()?;
        if refreshed {
            Ok(Some(self.tokens.lock().unwrap().clone()))
        } else {
            Ok(None)
        }
    }

    fn take_rotated_tokens(&self) -> Option<TokenSet> {
        self.rotated.lock().unwrap().take()
    }
}

/// Builds Gmail clients from stored grant tokens
pub struct GmailConnector {
    auth: GmailAuth,
}

impl GmailConnector {
    pub fn new(auth: GmailAuth) -> Self {
        Self { auth }
    }
}

impl MailboxConnector for GmailConnector {
    fn connect(&self, tokens: TokenSet) -> Result<Arc<dyn MailboxApi>> {
        Ok(Arc::new(GmailClient::new(self.auth.clone(), tokens)))
    }
}
